use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use scopewire_socket::{lock, matches_prefix, PublishSocket, SocketConfig};
use scopewire_transport::Endpoint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{PropertyError, Result};
use crate::update::PropertyUpdate;

/// What a subscriber sees when it joins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LateJoin {
    /// Only changes made after joining.
    #[default]
    Deltas,
    /// The current value of every matching property, then changes.
    Snapshot,
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub late_join: LateJoin,
    pub socket: SocketConfig,
    /// How often the worker checks for new subscribers when idle.
    pub poll_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            late_join: LateJoin::Deltas,
            socket: SocketConfig::default(),
            poll_interval: Duration::from_millis(20),
        }
    }
}

enum Outgoing {
    Update(PropertyUpdate),
    Rebroadcast,
}

struct Shared {
    table: Mutex<BTreeMap<String, Value>>,
    queue: Sender<Outgoing>,
    running: AtomicBool,
    subscribers: AtomicUsize,
    subscriptions: AtomicUsize,
}

impl Shared {
    fn set(&self, name: &str, value: Value) -> Result<bool> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(PropertyError::Stopped);
        }
        // The table lock is held across the enqueue so queue order matches table order.
        let mut table = lock(&self.table);
        if table.get(name) == Some(&value) {
            return Ok(false);
        }
        table.insert(name.to_string(), value.clone());
        self.queue
            .send(Outgoing::Update(PropertyUpdate {
                name: name.to_string(),
                value,
            }))
            .map_err(|_| PropertyError::Stopped)?;
        Ok(true)
    }
}

/// Holds every property's current value and publishes changes.
pub struct PropertyPublisher {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    endpoint: Endpoint,
}

impl PropertyPublisher {
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        Self::bind_with_config(endpoint, PublisherConfig::default())
    }

    pub fn bind_with_config(endpoint: &Endpoint, config: PublisherConfig) -> Result<Self> {
        let socket = PublishSocket::bind_with_config(endpoint, config.socket.clone())?;
        let endpoint = socket.endpoint().clone();
        let (queue, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            table: Mutex::new(BTreeMap::new()),
            queue,
            running: AtomicBool::new(true),
            subscribers: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("sw-properties".to_string())
            .spawn(move || run(socket, rx, &worker_shared, &config))?;
        info!(%endpoint, "property publisher started");
        Ok(Self {
            shared,
            worker: Some(worker),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Declare a property with its initial value and publish it.
    pub fn add_property<T: Serialize>(&self, name: &str, initial: &T) -> Result<PropertyHandle> {
        self.update(name, initial)?;
        Ok(PropertyHandle {
            shared: Arc::clone(&self.shared),
            name: name.to_string(),
        })
    }

    /// Set `name`; subscribers are told only if the value changed.
    ///
    /// Returns whether an update was queued. Values that fail to serialize
    /// are rejected before anything changes.
    pub fn update<T: Serialize>(&self, name: &str, value: &T) -> Result<bool> {
        let value = serde_json::to_value(value)?;
        self.shared.set(name, value)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        lock(&self.shared.table).get(name).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        lock(&self.shared.table).clone()
    }

    /// Send every current value again.
    pub fn rebroadcast(&self) -> Result<()> {
        self.shared
            .queue
            .send(Outgoing::Rebroadcast)
            .map_err(|_| PropertyError::Stopped)
    }

    /// Connected subscribers, as of the worker's last poll.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.load(Ordering::SeqCst)
    }

    /// Registered (subscriber, prefix) pairs, as of the worker's last poll.
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PropertyPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Setter for one property; cheap to clone into device callbacks.
#[derive(Clone)]
pub struct PropertyHandle {
    shared: Arc<Shared>,
    name: String,
}

impl PropertyHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set<T: Serialize>(&self, value: &T) -> Result<bool> {
        self.shared.set(&self.name, serde_json::to_value(value)?)
    }

    pub fn get(&self) -> Option<Value> {
        lock(&self.shared.table).get(&self.name).cloned()
    }
}

impl std::fmt::Debug for PropertyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyHandle").field("name", &self.name).finish()
    }
}

/// A typed value that publishes itself on every change.
pub struct Observable<T> {
    value: Mutex<T>,
    handle: PropertyHandle,
}

impl<T: Serialize + Clone> Observable<T> {
    pub fn new(publisher: &PropertyPublisher, name: &str, initial: T) -> Result<Self> {
        let handle = publisher.add_property(name, &initial)?;
        Ok(Self {
            value: Mutex::new(initial),
            handle,
        })
    }

    pub fn get(&self) -> T {
        lock(&self.value).clone()
    }

    pub fn set(&self, value: T) -> Result<()> {
        let mut current = lock(&self.value);
        self.handle.set(&value)?;
        *current = value;
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }
}

fn run(mut socket: PublishSocket, rx: Receiver<Outgoing>, shared: &Shared, config: &PublisherConfig) {
    while shared.running.load(Ordering::SeqCst) {
        match rx.recv_timeout(config.poll_interval) {
            Ok(Outgoing::Update(update)) => publish(&mut socket, &update),
            Ok(Outgoing::Rebroadcast) => {
                let snapshot = lock(&shared.table).clone();
                debug!(properties = snapshot.len(), "rebroadcasting");
                for (name, value) in snapshot {
                    publish(&mut socket, &PropertyUpdate { name, value });
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        match socket.take_new_subscriptions() {
            Ok(fresh) if config.late_join == LateJoin::Snapshot => {
                for subscription in fresh {
                    send_snapshot(&mut socket, shared, &subscription.peer_id, &subscription.prefix);
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "property socket failed");
                break;
            }
        }
        shared
            .subscribers
            .store(socket.subscriber_count(), Ordering::SeqCst);
        shared
            .subscriptions
            .store(socket.subscription_count(), Ordering::SeqCst);
    }
    debug!("property publisher stopped");
}

fn publish(socket: &mut PublishSocket, update: &PropertyUpdate) {
    let body = match serde_json::to_vec(update) {
        Ok(body) => body,
        Err(err) => {
            warn!(name = %update.name, error = %err, "update not encodable");
            return;
        }
    };
    match socket.publish(&update.name, &body) {
        Ok(delivered) => debug!(name = %update.name, delivered, "property published"),
        Err(err) => warn!(name = %update.name, error = %err, "publish failed"),
    }
}

fn send_snapshot(socket: &mut PublishSocket, shared: &Shared, peer_id: &str, prefix: &str) {
    let snapshot = lock(&shared.table).clone();
    let mut sent = 0;
    for (name, value) in snapshot {
        if !matches_prefix(prefix, &name) {
            continue;
        }
        let update = PropertyUpdate { name, value };
        let Ok(body) = serde_json::to_vec(&update) else {
            continue;
        };
        if let Err(err) = socket.publish_to(peer_id, &update.name, &body) {
            debug!(peer_id, error = %err, "snapshot aborted");
            return;
        }
        sent += 1;
    }
    debug!(peer_id, prefix, sent, "snapshot sent to new subscriber");
}
