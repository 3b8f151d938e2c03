use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use scopewire_socket::{lock, PeerInfo, PushSocket, RequestSocket, SocketConfig};
use scopewire_transport::Endpoint;
use serde_json::{Map, Value};
use tracing::debug;

use crate::envelope::{CallEnvelope, InterruptRequest, Reply};
use crate::error::RpcError;
use crate::namespace::{CommandDescriptor, DESCRIBE};
use crate::Result;

/// Sends interrupts for an [`RpcClient`] from any thread.
#[derive(Clone)]
pub struct InterruptHandle {
    push: Arc<Mutex<PushSocket>>,
    current: Arc<Mutex<Option<String>>>,
}

impl InterruptHandle {
    /// Interrupt the call this client has in flight.
    ///
    /// Returns `false` without sending anything when no call is running.
    pub fn interrupt(&self) -> Result<bool> {
        let Some(call_id) = lock(&self.current).clone() else {
            return Ok(false);
        };
        self.send(Some(call_id))?;
        Ok(true)
    }

    /// Interrupt whatever the server is running, whoever issued it.
    pub fn abort_current(&self) -> Result<()> {
        self.send(None)
    }

    fn send(&self, call_id: Option<String>) -> Result<()> {
        debug!(call_id = ?call_id, "sending interrupt");
        let payload = serde_json::to_vec(&InterruptRequest { call_id })?;
        lock(&self.push).send(&[&payload])?;
        Ok(())
    }
}

/// Client connection to a dispatcher, with an optional interrupt channel.
pub struct RpcClient {
    socket: RequestSocket,
    interrupt: Option<InterruptHandle>,
    current: Arc<Mutex<Option<String>>>,
    next_call: u64,
}

impl RpcClient {
    pub fn connect(rpc: &Endpoint, interrupt: Option<&Endpoint>) -> Result<Self> {
        Self::connect_with_config(rpc, interrupt, &SocketConfig::default())
    }

    pub fn connect_with_config(
        rpc: &Endpoint,
        interrupt: Option<&Endpoint>,
        config: &SocketConfig,
    ) -> Result<Self> {
        let socket = RequestSocket::connect_with_config(rpc, config)?;
        let current = Arc::new(Mutex::new(None));
        let interrupt = match interrupt {
            Some(endpoint) => Some(InterruptHandle {
                push: Arc::new(Mutex::new(PushSocket::connect_with_config(endpoint, config)?)),
                current: Arc::clone(&current),
            }),
            None => None,
        };
        Ok(Self {
            socket,
            interrupt,
            current,
            next_call: 0,
        })
    }

    /// Fail calls that take longer than `timeout`. The connection is unusable afterwards.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.socket.set_timeout(timeout);
    }

    /// What the handshake told us about the server.
    pub fn server(&self) -> &PeerInfo {
        self.socket.peer()
    }

    pub fn interrupt_handle(&self) -> Option<InterruptHandle> {
        self.interrupt.clone()
    }

    /// Send one envelope and wait for its reply. A missing `call_id` is filled in.
    pub fn call_envelope(&mut self, mut envelope: CallEnvelope) -> Result<Reply> {
        self.next_call += 1;
        let call_id = envelope
            .call_id
            .get_or_insert_with(|| format!("{}-{}", self.socket.peer().peer_id, self.next_call))
            .clone();
        let payload = serde_json::to_vec(&envelope)?;

        *lock(&self.current) = Some(call_id);
        let result = self.socket.request(&[&payload]);
        lock(&self.current).take();

        Reply::from_message(&result?)
    }

    pub fn call(&mut self, path: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Reply> {
        self.call_envelope(CallEnvelope {
            path: path.to_string(),
            args,
            kwargs,
            call_id: None,
        })
    }

    /// Call and expect a `value` reply.
    pub fn call_value(
        &mut self,
        path: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        match self.call(path, args, kwargs)? {
            Reply::Value(value) => Ok(value),
            Reply::Error(fault) => Err(RpcError::Remote(fault)),
            Reply::Binary(_) => Err(RpcError::Protocol(format!("'{path}' returned binary"))),
        }
    }

    /// Call and expect a `binary` reply.
    pub fn call_bytes(
        &mut self,
        path: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Bytes> {
        match self.call(path, args, kwargs)? {
            Reply::Binary(bytes) => Ok(bytes),
            Reply::Error(fault) => Err(RpcError::Remote(fault)),
            Reply::Value(_) => Err(RpcError::Protocol(format!("'{path}' returned a value"))),
        }
    }

    /// The server's command listing.
    pub fn describe(&mut self) -> Result<Vec<CommandDescriptor>> {
        let listing = self.call_value(DESCRIBE, Vec::new(), Map::new())?;
        Ok(serde_json::from_value(listing)?)
    }
}
