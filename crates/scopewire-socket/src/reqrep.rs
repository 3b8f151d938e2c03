use std::sync::Arc;
use std::time::{Duration, Instant};

use scopewire_frame::{Message, REPLY, REQUEST};
use scopewire_transport::Endpoint;
use tracing::debug;

use crate::connection::{Connection, PeerInfo, SocketConfig};
use crate::error::{Result, SocketError};
use crate::hub::{Hub, HubEvent};
use crate::pattern::Pattern;

/// Something that happened on a [`ReplySocket`].
#[derive(Debug)]
pub enum Incoming {
    /// A client connected.
    Connected(Arc<PeerInfo>),
    /// A request that must be answered with [`ReplySocket::reply`].
    Request {
        peer: Arc<PeerInfo>,
        message: Message,
    },
    /// A client went away; any per-connection state should be reclaimed.
    Disconnected(Arc<PeerInfo>),
}

/// Server end of request/reply.
///
/// Requests from every connection arrive through one queue. A client sends
/// its next request only after reading the previous reply, so replies on a
/// connection leave in request order as long as the caller answers each
/// request before taking the next one from that peer.
pub struct ReplySocket {
    hub: Hub,
}

impl ReplySocket {
    /// Bind with default settings.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        Self::bind_with_config(endpoint, SocketConfig::default())
    }

    /// Bind with explicit settings.
    pub fn bind_with_config(endpoint: &Endpoint, config: SocketConfig) -> Result<Self> {
        Ok(Self {
            hub: Hub::bind(endpoint, Pattern::Reply, config)?,
        })
    }

    /// The bound endpoint (with the real port for `tcp://host:0`).
    pub fn endpoint(&self) -> &Endpoint {
        self.hub.endpoint()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Incoming>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(event) = self.hub.recv_timeout(remaining)? else {
                return Ok(None);
            };
            match event {
                HubEvent::Joined(peer) => return Ok(Some(Incoming::Connected(peer))),
                HubEvent::Left(peer) => return Ok(Some(Incoming::Disconnected(peer))),
                HubEvent::Message(peer, message) if message.channel == REQUEST => {
                    return Ok(Some(Incoming::Request { peer, message }));
                }
                HubEvent::Message(peer, message) => {
                    debug!(peer_id = %peer.peer_id, channel = message.channel, "ignoring non-request message");
                }
            }
        }
    }

    /// Answer a request from `peer_id`.
    pub fn reply(&self, peer_id: &str, parts: &[&[u8]]) -> Result<()> {
        self.hub.send(peer_id, REPLY, parts)
    }

    /// Currently connected clients.
    pub fn peers(&self) -> Vec<Arc<PeerInfo>> {
        self.hub.peers()
    }

    /// Stop accepting and disconnect every client.
    pub fn shutdown(&mut self) {
        self.hub.shutdown();
    }
}

/// Client end of request/reply.
pub struct RequestSocket {
    connection: Connection,
    timeout: Option<Duration>,
    desynchronized: bool,
}

impl RequestSocket {
    /// Connect with default settings.
    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        Self::connect_with_config(endpoint, &SocketConfig::default())
    }

    /// Connect with explicit settings.
    pub fn connect_with_config(endpoint: &Endpoint, config: &SocketConfig) -> Result<Self> {
        Ok(Self {
            connection: Connection::connect(endpoint, Pattern::Request, config)?,
            timeout: None,
            desynchronized: false,
        })
    }

    /// Give up waiting for a reply after `timeout` (`None` waits forever).
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// The server side of this connection.
    pub fn peer(&self) -> &PeerInfo {
        self.connection.info()
    }

    /// Send one request and wait for its reply.
    pub fn request(&mut self, parts: &[&[u8]]) -> Result<Message> {
        if self.desynchronized {
            return Err(SocketError::Desynchronized);
        }
        self.connection.send(REQUEST, parts)?;

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let message = match deadline {
                None => self.connection.recv()?,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.connection.recv_timeout(remaining)? {
                        Some(message) => message,
                        None => {
                            self.desynchronized = true;
                            return Err(SocketError::Timeout(self.timeout.unwrap_or_default()));
                        }
                    }
                }
            };
            if message.channel == REPLY {
                return Ok(message);
            }
            debug!(channel = message.channel, "ignoring non-reply message");
        }
    }
}
