use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use scopewire_socket::{lock, matches_prefix, SocketConfig, SubscribeSocket};
use scopewire_transport::Endpoint;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::update::PropertyUpdate;

/// Called with the property name and its new value.
pub type PropertyCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Returned by `subscribe*`; pass to [`PropertySubscriber::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum Filter {
    Exact(String),
    Prefix(String),
}

impl Filter {
    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == name,
            Self::Prefix(prefix) => matches_prefix(prefix, name),
        }
    }
}

struct Registration {
    id: SubscriptionId,
    filter: Filter,
    callback: PropertyCallback,
}

#[derive(Default)]
struct Shared {
    mirror: Mutex<HashMap<String, Value>>,
    changed: Condvar,
    callbacks: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
    received: AtomicU64,
    running: AtomicBool,
}

/// Client side of the property feed.
///
/// A background thread keeps a mirror of the last value seen for each
/// property and runs matching callbacks. A panicking callback is logged
/// and the others still run.
pub struct PropertySubscriber {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PropertySubscriber {
    /// Receive every property.
    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        Self::connect_filtered(endpoint, &[""])
    }

    /// Ask the publisher for `prefixes` only.
    pub fn connect_filtered(endpoint: &Endpoint, prefixes: &[&str]) -> Result<Self> {
        let config = SocketConfig::default();
        let mut socket = SubscribeSocket::connect_with_config(endpoint, &config)?;
        for prefix in prefixes {
            socket.subscribe(prefix)?;
        }

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            ..Shared::default()
        });
        let worker_shared = Arc::clone(&shared);
        let poll = config.poll_interval;
        let worker = std::thread::Builder::new()
            .name("sw-property-sub".to_string())
            .spawn(move || run(socket, &worker_shared, poll))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Run `callback` for updates of exactly `name`.
    pub fn subscribe<F>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.register(Filter::Exact(name.to_string()), Arc::new(callback))
    }

    /// Run `callback` for every property under `prefix` (dotted segments).
    pub fn subscribe_prefix<F>(&self, prefix: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.register(Filter::Prefix(prefix.to_string()), Arc::new(callback))
    }

    fn register(&self, filter: Filter, callback: PropertyCallback) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.callbacks).push(Registration {
            id,
            filter,
            callback,
        });
        id
    }

    /// Returns whether `id` was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = lock(&self.shared.callbacks);
        let before = callbacks.len();
        callbacks.retain(|r| r.id != id);
        callbacks.len() != before
    }

    /// Last value seen for `name`.
    pub fn get(&self, name: &str) -> Option<Value> {
        lock(&self.shared.mirror).get(name).cloned()
    }

    pub fn properties(&self) -> HashMap<String, Value> {
        lock(&self.shared.mirror).clone()
    }

    /// Updates received so far.
    pub fn received(&self) -> u64 {
        self.shared.received.load(Ordering::SeqCst)
    }

    /// Block until `name` has a value satisfying `accept`, or `timeout` passes.
    pub fn wait_until(
        &self,
        name: &str,
        timeout: Duration,
        accept: impl Fn(&Value) -> bool,
    ) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        let mut mirror = lock(&self.shared.mirror);
        loop {
            if let Some(value) = mirror.get(name).filter(|v| accept(v)) {
                return Some(value.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            mirror = self
                .shared
                .changed
                .wait_timeout(mirror, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Block until `name` has any value.
    pub fn wait_for(&self, name: &str, timeout: Duration) -> Option<Value> {
        self.wait_until(name, timeout, |_| true)
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PropertySubscriber {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut socket: SubscribeSocket, shared: &Shared, poll: Duration) {
    while shared.running.load(Ordering::SeqCst) {
        let (topic, body) = match socket.recv_timeout(poll) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(err) => {
                warn!(error = %err, "property feed lost");
                break;
            }
        };
        let update: PropertyUpdate = match serde_json::from_slice(&body) {
            Ok(update) => update,
            Err(err) => {
                debug!(%topic, error = %err, "undecodable property update");
                continue;
            }
        };
        deliver(shared, update);
    }
    shared.running.store(false, Ordering::SeqCst);
}

fn deliver(shared: &Shared, update: PropertyUpdate) {
    {
        let mut mirror = lock(&shared.mirror);
        mirror.insert(update.name.clone(), update.value.clone());
        shared.received.fetch_add(1, Ordering::SeqCst);
        shared.changed.notify_all();
    }

    let matching: Vec<PropertyCallback> = lock(&shared.callbacks)
        .iter()
        .filter(|r| r.filter.matches(&update.name))
        .map(|r| Arc::clone(&r.callback))
        .collect();
    for callback in matching {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&update.name, &update.value)));
        if outcome.is_err() {
            warn!(name = %update.name, "property callback panicked");
        }
    }
}
