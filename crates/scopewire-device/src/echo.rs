//! A line-echoing device: the simulated hardware end and the capability
//! that exposes it over RPC.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use scopewire_property::PropertyHandle;
use scopewire_rpc::{Capability, Command, Fault, Output, Scope, Signature};
use scopewire_socket::lock;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::device::{AsyncDevice, Mode};

/// Far end of a loopback line that answers every line with itself after a
/// random delay of up to `max_delay`, so replies can overtake each other.
pub struct EchoResponder {
    reader: Option<JoinHandle<()>>,
}

impl EchoResponder {
    pub fn spawn(far: UnixStream, max_delay: Duration) -> io::Result<Self> {
        let writer = Arc::new(Mutex::new(far.try_clone()?));
        let reader = std::thread::Builder::new()
            .name("sw-echo-device".to_string())
            .spawn(move || respond(far, &writer, max_delay))?;
        Ok(Self {
            reader: Some(reader),
        })
    }

    /// Block until the line closes.
    pub fn join(mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn respond(far: UnixStream, writer: &Arc<Mutex<UnixStream>>, max_delay: Duration) {
    let mut seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.subsec_nanos() as u64)
        .unwrap_or(0x2545_f491)
        | 1;
    let max_millis = max_delay.as_millis() as u64;
    let mut reader = BufReader::new(far);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "echo device read failed");
                break;
            }
        }
        if line.last() != Some(&b'\n') {
            line.push(b'\n');
        }

        // xorshift; only used to shuffle reply timing.
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let delay = Duration::from_millis(if max_millis == 0 { 0 } else { seed % max_millis });

        let reply = line.clone();
        let writer = Arc::clone(writer);
        let spawned = std::thread::Builder::new()
            .name("sw-echo-reply".to_string())
            .spawn(move || {
                std::thread::sleep(delay);
                if let Err(err) = lock(&writer).write_all(&reply) {
                    debug!(error = %err, "echo device write failed");
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "echo device could not schedule a reply");
        }
    }
}

/// RPC surface of an echo device.
pub struct EchoDevice {
    device: Arc<AsyncDevice>,
    mode_property: Option<PropertyHandle>,
}

impl EchoDevice {
    pub fn new(device: Arc<AsyncDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            mode_property: None,
        })
    }

    /// Publish `true`/`false` under the handle's name whenever the mode
    /// changes.
    pub fn with_mode_property(device: Arc<AsyncDevice>, handle: PropertyHandle) -> Arc<Self> {
        if let Err(err) = handle.set(&(device.mode() == Mode::Async)) {
            warn!(error = %err, property = handle.name(), "cannot publish device mode");
        }
        Arc::new(Self {
            device,
            mode_property: Some(handle),
        })
    }

    pub fn device(&self) -> &Arc<AsyncDevice> {
        &self.device
    }

    fn set_async(&self, flag: bool) -> Result<(), Fault> {
        self.device.set_mode(if flag { Mode::Async } else { Mode::Sync });
        if let Some(handle) = &self.mode_property {
            handle.set(&flag).map_err(|err| Fault::runtime(err.to_string()))?;
        }
        Ok(())
    }
}

impl Capability for EchoDevice {
    fn register(self: Arc<Self>, scope: &mut Scope<'_>) {
        let echo = Arc::clone(&self);
        scope.add(
            Command::new("send", move |call, ctx| {
                let text: String = call.arg("text")?;
                let reply = echo.device.send(&text, &ctx.cancel)?;
                Ok(reply.map_or(Value::Null, |reply| json!(reply.text)).into())
            })
            .signature(Signature::new().required("text"))
            .doc("Send a line. Returns the echo in sync mode, null in async mode."),
        );

        let echo = Arc::clone(&self);
        scope.add(
            Command::new("wait", move |_, ctx| {
                echo.device.wait(&ctx.cancel)?;
                Ok(Output::none())
            })
            .doc("Block until every async send has been answered."),
        );

        let echo = Arc::clone(&self);
        scope.add(
            Command::new("set_async", move |call, _| {
                echo.set_async(call.arg("flag")?)?;
                Ok(Output::none())
            })
            .signature(Signature::new().required("flag")),
        );

        let echo = Arc::clone(&self);
        scope.add(Command::new("get_async", move |_, _| {
            Ok(json!(echo.device.mode() == Mode::Async).into())
        }));

        let echo = Arc::clone(&self);
        scope.add(Command::new("has_pending", move |_, _| {
            Ok(json!(echo.device.has_pending()).into())
        }));
    }
}
