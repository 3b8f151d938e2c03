use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scopewire_socket::{Incoming, PeerInfo, ReplySocket};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::envelope::{CallEnvelope, Reply};
use crate::error::{ErrorKind, Fault};
use crate::interrupt::Interrupter;
use crate::namespace::{CallContext, Namespace, Output, DESCRIBE};

/// Resolves call envelopes against a frozen [`Namespace`] and frames replies.
///
/// Calls are executed one at a time on the thread running [`serve`](Self::serve),
/// so a client always gets its replies in request order. Devices serialize
/// their own hardware access, so a slow call only delays other callers.
pub struct Dispatcher {
    namespace: Arc<Namespace>,
    interrupter: Option<Interrupter>,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace: Arc::new(namespace),
            interrupter: None,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Arm `interrupter` around every call.
    pub fn with_interrupter(mut self, interrupter: Interrupter) -> Self {
        self.interrupter = Some(interrupter);
        self
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    /// Decode one request payload from `peer` and produce its reply.
    pub fn dispatch(&self, payload: &[u8], peer: &Arc<PeerInfo>) -> Reply {
        let envelope: CallEnvelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(peer_id = %peer.peer_id, error = %err, "undecodable call envelope");
                return Reply::Error(Fault::bad_request(format!("invalid call envelope: {err}")));
            }
        };

        let ctx = CallContext {
            peer: Arc::clone(peer),
            cancel: CancelToken::new(),
            call_id: envelope.call_id.clone(),
        };
        let _armed = self
            .interrupter
            .as_ref()
            .map(|interrupter| interrupter.arm(ctx.call_id.as_deref(), &ctx.cancel));
        self.invoke(envelope, &ctx)
    }

    /// Run one call with an explicit context.
    pub fn invoke(&self, envelope: CallEnvelope, ctx: &CallContext) -> Reply {
        let started = Instant::now();
        let path = envelope.path;

        if path == DESCRIBE {
            return match serde_json::to_value(self.namespace.describe()) {
                Ok(listing) => Reply::Value(listing),
                Err(err) => Reply::Error(err.into()),
            };
        }
        let Some(command) = self.namespace.get(&path) else {
            debug!(path = %path, "unknown command");
            return Reply::Error(Fault::not_found(&path));
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            command.invoke(envelope.args, envelope.kwargs, ctx)
        }));
        let reply = match outcome {
            Ok(Ok(output)) => resolve(output, &ctx.peer),
            Ok(Err(fault)) => Reply::Error(fault),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(path = %path, %message, "command panicked");
                Reply::Error(Fault::runtime(message).with_detail(format!("panic in '{path}'")))
            }
        };

        match &reply {
            Reply::Error(fault) if fault.kind == ErrorKind::RuntimeFault => {
                warn!(path = %path, error = %fault, "command failed");
            }
            Reply::Error(fault) => debug!(path = %path, kind = %fault.kind, "command returned error"),
            _ => debug!(path = %path, elapsed_us = started.elapsed().as_micros() as u64, "command done"),
        }
        reply
    }

    /// Answer requests on `socket` until `stop` is set.
    pub fn serve(&self, socket: &ReplySocket, stop: &AtomicBool) -> scopewire_socket::Result<()> {
        info!(endpoint = %socket.endpoint(), commands = self.namespace.len(), "dispatcher serving");
        while !stop.load(Ordering::SeqCst) {
            match socket.recv_timeout(self.poll_interval)? {
                None => {}
                Some(Incoming::Connected(peer)) => {
                    info!(peer_id = %peer.peer_id, node = %peer.node, local = peer.local, "client connected");
                }
                Some(Incoming::Disconnected(peer)) => {
                    info!(peer_id = %peer.peer_id, "client disconnected");
                    for hook in self.namespace.disconnect_hooks() {
                        hook(&peer);
                    }
                }
                Some(Incoming::Request { peer, message }) => {
                    let reply = match message.part(0) {
                        Some(payload) if message.len() == 1 => self.dispatch(payload, &peer),
                        _ => Reply::Error(Fault::bad_request(format!(
                            "expected one request part, got {}",
                            message.len()
                        ))),
                    };
                    let body = reply.body();
                    if let Err(err) = socket.reply(&peer.peer_id, &[reply.tag().as_bytes(), &body]) {
                        warn!(peer_id = %peer.peer_id, error = %err, "reply not delivered");
                    }
                }
            }
        }
        info!("dispatcher stopped");
        Ok(())
    }
}

fn resolve(output: Output, peer: &PeerInfo) -> Reply {
    match output {
        Output::Value(value) => Reply::Value(value),
        Output::Binary(bytes) => Reply::Binary(bytes),
        Output::Transfer(payload) if peer.local => match payload.hand_off(peer) {
            Ok(name) => Reply::Value(Value::String(name)),
            Err(fault) => Reply::Error(fault),
        },
        Output::Transfer(payload) => match payload.pack() {
            Ok(bytes) => Reply::Binary(bytes),
            Err(fault) => Reply::Error(fault),
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "command panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{Command, Transferable};
    use crate::signature::Signature;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::Mutex;

    fn peer(local: bool) -> Arc<PeerInfo> {
        Arc::new(PeerInfo {
            peer_id: "peer-1".to_string(),
            node: "bench".to_string(),
            local,
            transport: "tcp",
        })
    }

    struct Frame(Arc<Mutex<Vec<String>>>);

    impl Transferable for Frame {
        fn hand_off(self: Box<Self>, peer: &PeerInfo) -> Result<String, Fault> {
            self.0.lock().unwrap().push(peer.peer_id.clone());
            Ok("/sw-frame-1".to_string())
        }

        fn pack(self: Box<Self>) -> Result<Bytes, Fault> {
            Ok(Bytes::from_static(b"\x01\x02"))
        }
    }

    fn dispatcher(handoffs: Arc<Mutex<Vec<String>>>) -> Dispatcher {
        let mut builder = Namespace::builder();
        builder
            .add(Command::new("_ping", |_, _| Ok(json!("pong").into())))
            .add(
                Command::new("add", |call, _| {
                    Ok(json!(call.arg::<i64>("a")? + call.arg::<i64>("b")?).into())
                })
                .signature(Signature::new().required("a").optional("b", 1)),
            )
            .add(Command::new("raw", |_, _| Ok(Output::Binary(Bytes::from_static(b"\xff")))))
            .add(Command::new("fail", |_, _| Err(Fault::runtime("lamp burnt out"))))
            .add(Command::new("boom", |_, _| panic!("shutter jammed")))
            .add(Command::new("image", move |_, _| {
                Ok(Output::Transfer(Box::new(Frame(Arc::clone(&handoffs)))))
            }));
        Dispatcher::new(builder.build().unwrap())
    }

    fn call(d: &Dispatcher, body: serde_json::Value, local: bool) -> Reply {
        d.dispatch(body.to_string().as_bytes(), &peer(local))
    }

    #[test]
    fn classifies_values_and_binary() {
        let d = dispatcher(Arc::default());
        assert_eq!(call(&d, json!({"path": "_ping"}), true), Reply::Value(json!("pong")));
        assert_eq!(
            call(&d, json!({"path": "add", "args": [2], "kwargs": {"b": 3}}), true),
            Reply::Value(json!(5))
        );
        assert_eq!(
            call(&d, json!({"path": "raw"}), true),
            Reply::Binary(Bytes::from_static(b"\xff"))
        );
    }

    #[test]
    fn unknown_path_is_not_found() {
        let d = dispatcher(Arc::default());
        let Reply::Error(fault) = call(&d, json!({"path": "stage.fly"}), true) else {
            panic!("expected error");
        };
        assert_eq!(fault.kind, ErrorKind::NotFound);
    }

    #[test]
    fn errors_and_panics_become_runtime_faults() {
        let d = dispatcher(Arc::default());
        let Reply::Error(fault) = call(&d, json!({"path": "fail"}), true) else {
            panic!("expected error");
        };
        assert_eq!(fault.kind, ErrorKind::RuntimeFault);
        assert_eq!(fault.message, "lamp burnt out");

        let Reply::Error(fault) = call(&d, json!({"path": "boom"}), true) else {
            panic!("expected error");
        };
        assert_eq!(fault.kind, ErrorKind::RuntimeFault);
        assert!(fault.message.contains("shutter jammed"));
        assert_eq!(call(&d, json!({"path": "_ping"}), true), Reply::Value(json!("pong")));
    }

    #[test]
    fn bad_arguments_and_envelopes_are_rejected() {
        let d = dispatcher(Arc::default());
        for body in [
            json!({"path": "add"}),
            json!({"path": "add", "args": [1, 2, 3]}),
            json!({"path": "add", "kwargs": {"a": 1, "c": 2}}),
            json!({"path": "add", "args": ["x"]}),
            json!({"args": []}),
        ] {
            let Reply::Error(fault) = call(&d, body.clone(), true) else {
                panic!("expected error for {body}");
            };
            assert_eq!(fault.kind, ErrorKind::BadRequest, "{body}");
        }
    }

    #[test]
    fn describe_lists_every_command() {
        let d = dispatcher(Arc::default());
        let Reply::Value(listing) = call(&d, json!({"path": DESCRIBE}), true) else {
            panic!("expected value");
        };
        let paths: Vec<&str> = listing
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["_ping", "add", "boom", "fail", "image", "raw"]);
    }

    #[test]
    fn transfer_follows_peer_locality() {
        let handoffs = Arc::new(Mutex::new(Vec::new()));
        let d = dispatcher(Arc::clone(&handoffs));

        assert_eq!(
            call(&d, json!({"path": "image"}), true),
            Reply::Value(json!("/sw-frame-1"))
        );
        assert_eq!(handoffs.lock().unwrap().as_slice(), ["peer-1"]);

        assert_eq!(
            call(&d, json!({"path": "image"}), false),
            Reply::Binary(Bytes::from_static(b"\x01\x02"))
        );
        assert_eq!(handoffs.lock().unwrap().len(), 1);
    }
}
