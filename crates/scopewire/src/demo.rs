//! Simulated instruments mounted by `scoped serve --demo`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scopewire_buffer::{BufferMeta, BufferRegistry, Dtype, HeapBuffer};
use scopewire_device::{
    loopback, AsyncDevice, EchoDevice, EchoProtocol, EchoResponder, ManagerConfig, MessageManager,
    Protocol,
};
use scopewire_property::{PropertyHandle, PropertyPublisher};
use scopewire_rpc::{Capability, Command, Fault, Output, Scope, Signature};
use scopewire_socket::lock;
use serde_json::json;
use tracing::warn;

const MAX_SIDE: usize = 8192;

/// A camera that renders a moving 16-bit gradient.
pub struct Camera {
    registry: BufferRegistry,
    exposure_ms: Mutex<f64>,
    frames: AtomicU64,
    frame_property: Option<PropertyHandle>,
    exposure_property: Option<PropertyHandle>,
}

impl Camera {
    pub fn new(registry: BufferRegistry, properties: Option<&PropertyPublisher>) -> Arc<Self> {
        let add = |name: &str, initial: serde_json::Value| {
            properties.and_then(|publisher| match publisher.add_property(name, &initial) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!(property = name, error = %err, "property not published");
                    None
                }
            })
        };
        Arc::new(Self {
            registry,
            exposure_ms: Mutex::new(10.0),
            frames: AtomicU64::new(0),
            frame_property: add("camera.frame_count", json!(0)),
            exposure_property: add("camera.exposure", json!(10.0)),
        })
    }

    /// Row-major `height` x `width` little-endian u16 pixels.
    pub fn render(&self, width: usize, height: usize) -> Vec<u8> {
        let frame = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(handle) = &self.frame_property {
            if let Err(err) = handle.set(&frame) {
                warn!(property = handle.name(), frame, error = %err, "frame count not published");
            }
        }
        let mut data = Vec::with_capacity(width * height * 2);
        for y in 0..height {
            for x in 0..width {
                let value = (x as u64 + y as u64 * 3 + frame * 17) as u16;
                data.extend_from_slice(&value.to_le_bytes());
            }
        }
        data
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }
}

impl Capability for Camera {
    fn register(self: Arc<Self>, scope: &mut Scope<'_>) {
        let camera = Arc::clone(&self);
        scope.add(
            Command::new("acquire_image", move |call, ctx| {
                let width: usize = call.arg("width")?;
                let height: usize = call.arg("height")?;
                if width == 0 || height == 0 || width > MAX_SIDE || height > MAX_SIDE {
                    return Err(Fault::bad_request(format!(
                        "image size {width}x{height} out of range"
                    )));
                }
                let exposure = *lock(&camera.exposure_ms);
                ctx.cancel.sleep(Duration::from_secs_f64(exposure / 1000.0))?;
                let data = camera.render(width, height);
                let meta = BufferMeta::new([height, width], Dtype::U16);
                let image = HeapBuffer::new(&camera.registry, meta, data)?;
                Ok(Output::Transfer(Box::new(image)))
            })
            .signature(
                Signature::new()
                    .optional("width", 512)
                    .optional("height", 512),
            )
            .doc("Expose one frame. Local clients get a buffer name, remote ones packed bytes."),
        );

        let camera = Arc::clone(&self);
        scope.add(Command::new("get_exposure", move |_, _| {
            Ok(json!(*lock(&camera.exposure_ms)).into())
        }));

        let camera = Arc::clone(&self);
        scope.add(
            Command::new("set_exposure", move |call, _| {
                let value: f64 = call.arg("value")?;
                if !(0.0..=10_000.0).contains(&value) {
                    return Err(Fault::bad_request(format!("exposure {value} ms out of range")));
                }
                *lock(&camera.exposure_ms) = value;
                if let Some(handle) = &camera.exposure_property {
                    handle.set(&value).map_err(|err| Fault::runtime(err.to_string()))?;
                }
                Ok(Output::none())
            })
            .signature(Signature::new().required("value"))
            .doc("Exposure time in milliseconds."),
        );
    }
}

/// An echo device on an in-process serial line, with its simulated
/// hardware end.
pub struct EchoBench {
    pub device: Arc<EchoDevice>,
    pub manager: Arc<MessageManager>,
    pub responder: EchoResponder,
}

impl EchoBench {
    pub fn start(
        timeout: Duration,
        max_delay: Duration,
        properties: Option<&PropertyPublisher>,
    ) -> std::io::Result<Self> {
        let protocol: Arc<dyn Protocol> = Arc::new(EchoProtocol);
        let (channel, far) = loopback(protocol.terminator())?;
        let config = ManagerConfig {
            name: "echo".to_string(),
            timeout,
            ..ManagerConfig::default()
        };
        let manager = Arc::new(MessageManager::spawn(Box::new(channel), protocol, config)?);
        let responder = EchoResponder::spawn(far, max_delay)?;
        let async_device = Arc::new(AsyncDevice::new("echo", Arc::clone(&manager)));
        let device = match properties.map(|publisher| publisher.add_property("echo.async", &false)) {
            Some(Ok(handle)) => EchoDevice::with_mode_property(async_device, handle),
            Some(Err(err)) => {
                warn!(error = %err, "echo mode property not published");
                EchoDevice::new(async_device)
            }
            None => EchoDevice::new(async_device),
        };
        Ok(Self {
            device,
            manager,
            responder,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopewire_buffer::{unpack, RegistryConfig};
    use scopewire_rpc::{CallContext, CallEnvelope, Dispatcher, ErrorKind, Namespace, Reply};
    use scopewire_socket::PeerInfo;

    fn dispatcher() -> (BufferRegistry, Dispatcher) {
        let registry = BufferRegistry::new(RegistryConfig {
            prefix: format!("sw-demo-{}", std::process::id()),
            ..RegistryConfig::default()
        });
        let mut builder = Namespace::builder();
        builder.mount("camera", Camera::new(registry.clone(), None));
        (registry, Dispatcher::new(builder.build().unwrap()))
    }

    #[test]
    fn remote_clients_get_packed_frames() {
        let (registry, dispatcher) = dispatcher();
        let ctx = CallContext::new(Arc::new(PeerInfo {
            peer_id: "far-1".to_string(),
            node: "elsewhere".to_string(),
            local: false,
            transport: "tcp",
        }));
        let reply = dispatcher.invoke(
            CallEnvelope::new("camera.acquire_image").arg(4).arg(3),
            &ctx,
        );
        let Reply::Binary(bytes) = reply else {
            panic!("expected packed bytes, got {reply:?}");
        };
        let (meta, data) = unpack(&bytes).unwrap();
        assert_eq!(meta.shape, vec![3, 4]);
        assert_eq!(meta.dtype, Dtype::U16);
        assert_eq!(data.len(), 24);
        assert!(registry.is_empty());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let (_registry, dispatcher) = dispatcher();
        let reply = dispatcher.invoke(
            CallEnvelope::new("camera.acquire_image").kwarg("width", 0),
            &CallContext::in_process(),
        );
        match reply {
            Reply::Error(fault) => assert_eq!(fault.kind, ErrorKind::BadRequest),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exposure_round_trips() {
        let (_registry, dispatcher) = dispatcher();
        let ctx = CallContext::in_process();
        dispatcher.invoke(CallEnvelope::new("camera.set_exposure").arg(2.5), &ctx);
        assert_eq!(
            dispatcher.invoke(CallEnvelope::new("camera.get_exposure"), &ctx),
            Reply::Value(json!(2.5))
        );
    }

    #[test]
    fn frames_render_after_the_property_feed_stops() {
        let registry = BufferRegistry::new(RegistryConfig::default());
        let mut publisher =
            PropertyPublisher::bind(&scopewire_transport::Endpoint::tcp("127.0.0.1", 0)).unwrap();
        let camera = Camera::new(registry, Some(&publisher));
        camera.render(2, 2);
        assert_eq!(publisher.get("camera.frame_count"), Some(json!(1)));

        publisher.stop();
        let data = camera.render(2, 2);
        assert_eq!(data.len(), 8);
        assert_eq!(camera.frames(), 2);
        assert_eq!(publisher.get("camera.frame_count"), Some(json!(1)));
    }
}
