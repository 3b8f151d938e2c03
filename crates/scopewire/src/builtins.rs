//! Diagnostic commands every daemon serves.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use scopewire_property::PropertyPublisher;
use scopewire_rpc::{Capability, Command, Fault, Output, Scope, Signature};
use serde_json::json;

/// `_ping`, `_sleep`, `time` and `rebroadcast_properties`, mounted at the
/// namespace root.
pub struct Builtins {
    properties: Option<Arc<PropertyPublisher>>,
}

impl Builtins {
    pub fn new(properties: Option<Arc<PropertyPublisher>>) -> Arc<Self> {
        Arc::new(Self { properties })
    }
}

impl Capability for Builtins {
    fn register(self: Arc<Self>, scope: &mut Scope<'_>) {
        scope.add(
            Command::new("_ping", |_, _| Ok(json!("pong").into())).doc("Liveness check."),
        );

        scope.add(
            Command::new("_sleep", |call, ctx| {
                let seconds: f64 = call.arg("seconds")?;
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(Fault::bad_request(format!("invalid duration {seconds}")));
                }
                ctx.cancel.sleep(Duration::from_secs_f64(seconds))?;
                Ok(Output::none())
            })
            .signature(Signature::new().required("seconds"))
            .doc("Block for a while; interruptible."),
        );

        scope.add(
            Command::new("time", |_, _| {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or_default();
                Ok(json!(now).into())
            })
            .doc("Seconds since the unix epoch on the daemon host."),
        );

        let builtins = Arc::clone(&self);
        scope.add(
            Command::new("rebroadcast_properties", move |_, _| {
                let Some(publisher) = &builtins.properties else {
                    return Ok(json!(0).into());
                };
                publisher
                    .rebroadcast()
                    .map_err(|err| Fault::runtime(err.to_string()))?;
                Ok(json!(publisher.snapshot().len()).into())
            })
            .doc("Publish every property's current value again."),
        );
    }
}
