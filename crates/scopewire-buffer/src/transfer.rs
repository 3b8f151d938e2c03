use std::sync::Arc;

use scopewire_rpc::{Capability, Command, Output, Scope, Signature};
use serde_json::json;
use tracing::debug;

use crate::pack::{pack, Compressor, PackOptions};
use crate::registry::BufferRegistry;

/// Prefix the transfer operations are mounted under.
pub const TRANSFER_PREFIX: &str = "_transfer";

/// Reserved commands clients use to complete buffer handoffs.
///
/// Mounting also installs a disconnect hook that reclaims every handoff
/// the lost connection never confirmed.
pub struct TransferOps {
    registry: BufferRegistry,
}

impl TransferOps {
    pub fn new(registry: BufferRegistry) -> Arc<Self> {
        Arc::new(Self { registry })
    }
}

impl Capability for TransferOps {
    fn register(self: Arc<Self>, scope: &mut Scope<'_>) {
        let ops = Arc::clone(&self);
        scope.add(
            Command::new("node", move |_, _| Ok(json!(ops.registry.node_name()).into()))
                .doc("Host name of the daemon, for locality checks."),
        );

        let ops = Arc::clone(&self);
        scope.add(
            Command::new("register", move |call, ctx| {
                let name: String = call.arg("name")?;
                let counts = ops.registry.register_for_transfer(&name, &ctx.peer.peer_id)?;
                Ok(json!(counts.pending).into())
            })
            .signature(Signature::new().required("name"))
            .doc("Hold a buffer for this connection until release_pending."),
        );

        let ops = Arc::clone(&self);
        scope.add(
            Command::new("release_pending", move |call, ctx| {
                let name: String = call.arg("name")?;
                let counts = ops.registry.release_pending(&name, &ctx.peer.peer_id)?;
                Ok(json!({"refcount": counts.refcount, "pending": counts.pending}).into())
            })
            .signature(Signature::new().required("name"))
            .doc("Confirm a buffer handed to this connection was opened."),
        );

        let ops = Arc::clone(&self);
        scope.add(
            Command::new("pack", move |call, ctx| {
                let name: String = call.arg("name")?;
                let compressor: Compressor = call.arg::<String>("compressor")?.parse()?;
                let options = PackOptions {
                    compressor,
                    level: call.arg("level")?,
                    downsample: call.arg::<usize>("downsample")?.max(1),
                };
                let (meta, data) = ops.registry.read_bytes(&name)?;
                let packed = pack(&meta, &data, &options)?;
                // A client that cannot map the buffer is done with its handoff.
                if ops.registry.release_pending(&name, &ctx.peer.peer_id).is_ok() {
                    debug!(%name, peer_id = %ctx.peer.peer_id, "handoff settled by pack");
                }
                Ok(Output::Binary(packed))
            })
            .signature(
                Signature::new()
                    .required("name")
                    .optional("compressor", "none")
                    .optional("level", 6)
                    .optional("downsample", 1),
            )
            .doc("Packed bytes of a buffer, for clients on another host."),
        );

        let ops = Arc::clone(&self);
        scope.on_disconnect(move |peer| {
            let reclaimed = ops.registry.reclaim_owner(&peer.peer_id);
            if reclaimed > 0 {
                debug!(peer_id = %peer.peer_id, reclaimed, "handoffs reclaimed on disconnect");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::BufferMeta;
    use crate::pack::unpack;
    use crate::registry::RegistryConfig;
    use scopewire_rpc::{CallContext, CallEnvelope, Dispatcher, Namespace, Reply};

    fn setup() -> (BufferRegistry, Dispatcher) {
        let registry = BufferRegistry::new(RegistryConfig {
            prefix: format!("sw-ops-{}", std::process::id()),
            ..RegistryConfig::default()
        });
        let mut builder = Namespace::builder();
        builder.mount(TRANSFER_PREFIX, TransferOps::new(registry.clone()));
        (registry, Dispatcher::new(builder.build().unwrap()))
    }

    #[test]
    fn register_and_release_through_commands() {
        let (registry, dispatcher) = setup();
        let buffer = registry.create(BufferMeta::bytes(4)).unwrap();
        let name = buffer.name().to_string();
        let ctx = CallContext::in_process();

        let reply = dispatcher.invoke(CallEnvelope::new("_transfer.register").arg(name.as_str()), &ctx);
        assert_eq!(reply, Reply::Value(json!(1)));
        buffer.release().unwrap();
        assert!(registry.contains(&name));

        let reply = dispatcher.invoke(
            CallEnvelope::new("_transfer.release_pending").kwarg("name", name.as_str()),
            &ctx,
        );
        assert_eq!(reply, Reply::Value(json!({"refcount": 0, "pending": 0})));
        assert!(!registry.contains(&name));
    }

    #[test]
    fn pack_returns_binary_and_settles_handoff() {
        let (registry, dispatcher) = setup();
        let mut buffer = registry.create(BufferMeta::bytes(4)).unwrap();
        buffer.write_at(0, b"scan").unwrap();
        let name = buffer.name().to_string();
        let ctx = CallContext::in_process();
        registry
            .register_for_transfer(&name, &ctx.peer.peer_id)
            .unwrap();

        let reply = dispatcher.invoke(
            CallEnvelope::new("_transfer.pack")
                .arg(name.as_str())
                .kwarg("compressor", "zlib"),
            &ctx,
        );
        let Reply::Binary(packed) = reply else {
            panic!("expected binary reply");
        };
        assert_eq!(unpack(&packed).unwrap().1, b"scan");
        assert_eq!(registry.counts(&name).unwrap().pending, 0);
    }

    #[test]
    fn unknown_buffer_is_not_found() {
        let (_registry, dispatcher) = setup();
        let reply = dispatcher.invoke(
            CallEnvelope::new("_transfer.release_pending").arg("/sw-nothing"),
            &CallContext::in_process(),
        );
        let Reply::Error(fault) = reply else {
            panic!("expected error");
        };
        assert_eq!(fault.kind, scopewire_rpc::ErrorKind::NotFound);
    }
}
