use std::sync::Arc;
use std::time::{Duration, Instant};

use scopewire_frame::{Message, SIGNAL};
use scopewire_transport::Endpoint;
use tracing::debug;

use crate::connection::{Connection, PeerInfo, SocketConfig};
use crate::error::Result;
use crate::hub::{Hub, HubEvent};
use crate::pattern::Pattern;

/// Sending end of a one-way signal channel.
pub struct PushSocket {
    connection: Connection,
}

impl PushSocket {
    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        Self::connect_with_config(endpoint, &SocketConfig::default())
    }

    pub fn connect_with_config(endpoint: &Endpoint, config: &SocketConfig) -> Result<Self> {
        Ok(Self {
            connection: Connection::connect(endpoint, Pattern::Push, config)?,
        })
    }

    pub fn peer(&self) -> &PeerInfo {
        self.connection.info()
    }

    /// Send one signal. No acknowledgement is returned.
    pub fn send(&mut self, parts: &[&[u8]]) -> Result<()> {
        self.connection.send(SIGNAL, parts)
    }
}

/// Receiving end of a one-way signal channel. Accepts any number of pushers.
pub struct PullSocket {
    hub: Hub,
}

impl PullSocket {
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        Self::bind_with_config(endpoint, SocketConfig::default())
    }

    pub fn bind_with_config(endpoint: &Endpoint, config: SocketConfig) -> Result<Self> {
        Ok(Self {
            hub: Hub::bind(endpoint, Pattern::Pull, config)?,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.hub.endpoint()
    }

    /// Wait up to `timeout` for the next signal, skipping connection events.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<(Arc<PeerInfo>, Message)>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.hub.recv_timeout(remaining)? {
                None => return Ok(None),
                Some(HubEvent::Message(peer, message)) if message.channel == SIGNAL => {
                    return Ok(Some((peer, message)));
                }
                Some(HubEvent::Message(peer, message)) => {
                    debug!(peer_id = %peer.peer_id, channel = message.channel, "ignoring non-signal message");
                }
                Some(HubEvent::Joined(_)) | Some(HubEvent::Left(_)) => {}
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.hub.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_from_several_pushers_arrive() {
        let pull = PullSocket::bind(&Endpoint::tcp("127.0.0.1", 0)).unwrap();
        let mut a = PushSocket::connect(pull.endpoint()).unwrap();
        let mut b = PushSocket::connect(pull.endpoint()).unwrap();
        a.send(&[b"stop-a"]).unwrap();
        b.send(&[b"stop-b"]).unwrap();

        let mut got = Vec::new();
        while got.len() < 2 {
            let (_, message) = pull
                .recv_timeout(Duration::from_secs(2))
                .unwrap()
                .expect("signal should arrive");
            got.push(message.part_str(0).unwrap().to_string());
        }
        got.sort();
        assert_eq!(got, vec!["stop-a", "stop-b"]);
    }

    #[test]
    fn quiet_channel_times_out() {
        let pull = PullSocket::bind(&Endpoint::tcp("127.0.0.1", 0)).unwrap();
        let started = Instant::now();
        assert!(pull.recv_timeout(Duration::from_millis(100)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[cfg(unix)]
    #[test]
    fn works_over_unix_socket() {
        let dir = std::env::temp_dir().join(format!("sw-pull-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let endpoint = Endpoint::ipc(dir.join("interrupt.sock"));
        let pull = PullSocket::bind(&endpoint).unwrap();
        let mut push = PushSocket::connect(&endpoint).unwrap();
        assert!(push.peer().local);
        push.send(&[b"{}"]).unwrap();
        let (peer, _) = pull
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert!(peer.local);
        drop(pull);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
