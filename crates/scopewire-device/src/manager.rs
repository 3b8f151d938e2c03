use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use scopewire_rpc::CancelToken;
use scopewire_socket::lock;
use tracing::{debug, info, trace, warn};

use crate::channel::SerialChannel;
use crate::completion::{Completion, DeviceReply};
use crate::error::{DeviceError, Result};
use crate::protocol::{Decoded, Protocol, ReplyStatus};

/// Runs on the worker thread for every reply carrying the listener's key.
pub type Listener = Arc<dyn Fn(&Decoded) + Send + Sync>;

/// Runs on the worker thread when one call resolves.
pub type ReplyCallback = Box<dyn FnOnce(&Result<DeviceReply>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Used in thread names and logs.
    pub name: String,
    /// Reply deadline for calls that do not set their own.
    pub timeout: Duration,
    /// One reply retires every pending call with its key.
    pub coalesce: bool,
    /// Longest the worker blocks on the line before servicing the queue.
    pub poll_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "device".to_string(),
            timeout: Duration::from_secs(2),
            coalesce: false,
            poll_interval: Duration::from_millis(10),
        }
    }
}

struct Pending {
    id: u64,
    completion: Arc<Completion>,
    deadline: Instant,
    timeout: Duration,
    callback: Option<ReplyCallback>,
}

impl Pending {
    fn resolve(mut self, outcome: Result<DeviceReply>) {
        if let Some(callback) = self.callback.take() {
            if catch_unwind(AssertUnwindSafe(|| callback(&outcome))).is_err() {
                warn!(call = self.id, "reply callback panicked");
            }
        }
        self.completion.complete(outcome);
    }
}

#[derive(Default)]
struct Table {
    pending: HashMap<String, VecDeque<Pending>>,
    /// Set once the line is gone; checked under the same lock as inserts.
    closed: Option<DeviceError>,
}

impl Table {
    fn count(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    fn drain_all(&mut self) -> Vec<Pending> {
        self.pending.drain().flat_map(|(_, queue)| queue).collect()
    }
}

struct Shared {
    name: String,
    protocol: Arc<dyn Protocol>,
    table: Mutex<Table>,
    listeners: Mutex<Vec<(ListenerId, String, Listener)>>,
    outgoing: Sender<Vec<u8>>,
    running: AtomicBool,
    next_id: AtomicU64,
    unmatched: AtomicU64,
    coalesce: bool,
}

/// A call waiting for its reply.
pub struct PendingCall {
    key: String,
    completion: Arc<Completion>,
}

impl PendingCall {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_resolved(&self) -> bool {
        self.completion.is_done()
    }

    /// The outcome, if resolved.
    pub fn try_result(&self) -> Option<Result<DeviceReply>> {
        self.completion.peek()
    }

    /// Block until resolved. Cancellation leaves the call matched to its
    /// reply; only this wait ends.
    pub fn wait(&self, cancel: &CancelToken) -> Result<DeviceReply> {
        self.completion.wait(cancel)
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("key", &self.key)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Sole reader and writer of one serial line.
///
/// Instructions go out in the order they were sent. Replies are matched to
/// calls by key, so a device answering out of order still resolves the
/// right call. Calls sharing a key resolve first-in first-out.
pub struct MessageManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl MessageManager {
    pub fn spawn(
        channel: Box<dyn SerialChannel>,
        protocol: Arc<dyn Protocol>,
        config: ManagerConfig,
    ) -> std::io::Result<Self> {
        let (outgoing, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            protocol,
            table: Mutex::new(Table::default()),
            listeners: Mutex::new(Vec::new()),
            outgoing,
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            unmatched: AtomicU64::new(0),
            coalesce: config.coalesce,
        });

        let line = channel.describe();
        let worker_shared = Arc::clone(&shared);
        let poll = config.poll_interval;
        let worker = std::thread::Builder::new()
            .name(format!("sw-serial-{}", config.name))
            .spawn(move || run(channel, rx, &worker_shared, poll))?;
        info!(device = %config.name, %line, "message manager started");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            timeout: config.timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue `instruction` with the default timeout.
    pub fn send(&self, instruction: &str) -> Result<PendingCall> {
        self.send_with(instruction, self.timeout, None)
    }

    /// Queue `instruction`; `callback` runs on the worker once it resolves.
    pub fn send_with(
        &self,
        instruction: &str,
        timeout: Duration,
        callback: Option<ReplyCallback>,
    ) -> Result<PendingCall> {
        let encoded = self.shared.protocol.encode(instruction)?;
        let completion = Arc::new(Completion::default());
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        // Registered before the bytes are queued so a fast reply finds it.
        {
            let mut table = lock(&self.shared.table);
            if let Some(err) = &table.closed {
                return Err(err.clone());
            }
            table
                .pending
                .entry(encoded.key.clone())
                .or_default()
                .push_back(Pending {
                    id,
                    completion: Arc::clone(&completion),
                    deadline: Instant::now() + timeout,
                    timeout,
                    callback,
                });
            self.shared
                .outgoing
                .send(encoded.bytes)
                .map_err(|_| DeviceError::Stopped)?;
        }
        trace!(device = %self.shared.name, key = %encoded.key, call = id, "queued");
        Ok(PendingCall {
            key: encoded.key,
            completion,
        })
    }

    /// Send and block for the reply.
    pub fn request(&self, instruction: &str, cancel: &CancelToken) -> Result<DeviceReply> {
        if cancel.is_cancelled() {
            return Err(DeviceError::Interrupted);
        }
        self.send(instruction)?.wait(cancel)
    }

    /// Run `listener` for every reply keyed `key`, including status events
    /// nobody asked for. Listeners stay until removed.
    pub fn add_listener(&self, key: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.listeners).push((id, key.to_string(), listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.shared.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _, _)| *existing != id);
        listeners.len() != before
    }

    /// Replies that matched neither a pending call nor a listener.
    pub fn unmatched_count(&self) -> u64 {
        self.shared.unmatched.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.shared.table).count()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.table).closed.is_none()
    }

    /// Stop the worker. Calls still pending fail with `Stopped`.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for MessageManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MessageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageManager")
            .field("name", &self.shared.name)
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn run(
    mut channel: Box<dyn SerialChannel>,
    outgoing: Receiver<Vec<u8>>,
    shared: &Shared,
    poll: Duration,
) {
    let outcome = loop {
        if !shared.running.load(Ordering::SeqCst) {
            break DeviceError::Stopped;
        }

        match write_queued(channel.as_mut(), &outgoing) {
            Ok(()) => {}
            Err(err) => break DeviceError::Disconnected(err.to_string()),
        }

        match channel.read_reply(poll) {
            Ok(Some(raw)) => dispatch(shared, &raw),
            Ok(None) => {}
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                shared.unmatched.fetch_add(1, Ordering::SeqCst);
                warn!(device = %shared.name, error = %err, "oversized reply discarded");
            }
            Err(err) => break DeviceError::Disconnected(err.to_string()),
        }

        expire(shared, Instant::now());
    };

    match &outcome {
        DeviceError::Stopped => debug!(device = %shared.name, "message manager stopping"),
        err => warn!(device = %shared.name, error = %err, "serial line lost"),
    }
    let orphans = {
        let mut table = lock(&shared.table);
        table.closed = Some(outcome.clone());
        table.drain_all()
    };
    for pending in orphans {
        pending.resolve(Err(outcome.clone()));
    }
}

fn write_queued(channel: &mut dyn SerialChannel, outgoing: &Receiver<Vec<u8>>) -> std::io::Result<()> {
    loop {
        match outgoing.try_recv() {
            Ok(bytes) => channel.write_all(&bytes)?,
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Ok(()),
        }
    }
}

fn dispatch(shared: &Shared, raw: &[u8]) {
    let decoded = match shared.protocol.decode(raw) {
        Ok(decoded) => decoded,
        Err(err) => {
            shared.unmatched.fetch_add(1, Ordering::SeqCst);
            warn!(device = %shared.name, error = %err, raw = %String::from_utf8_lossy(raw), "unkeyable reply");
            return;
        }
    };

    let listeners: Vec<Listener> = lock(&shared.listeners)
        .iter()
        .filter(|(_, key, _)| *key == decoded.key)
        .map(|(_, _, listener)| Arc::clone(listener))
        .collect();
    for listener in &listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(&decoded))).is_err() {
            warn!(device = %shared.name, key = %decoded.key, "listener panicked");
        }
    }

    let matched: Vec<Pending> = if decoded.unsolicited {
        Vec::new()
    } else {
        let mut table = lock(&shared.table);
        match table.pending.get_mut(&decoded.key) {
            Some(queue) => {
                let taken: Vec<Pending> = if shared.coalesce {
                    queue.drain(..).collect()
                } else {
                    queue.pop_front().into_iter().collect()
                };
                if queue.is_empty() {
                    table.pending.remove(&decoded.key);
                }
                taken
            }
            None => Vec::new(),
        }
    };

    if matched.is_empty() {
        if listeners.is_empty() {
            shared.unmatched.fetch_add(1, Ordering::SeqCst);
            warn!(device = %shared.name, key = %decoded.key, text = %decoded.text, "unmatched reply");
        }
        return;
    }

    let outcome = match &decoded.status {
        ReplyStatus::Ok => Ok(DeviceReply {
            key: decoded.key.clone(),
            text: decoded.text.clone(),
        }),
        ReplyStatus::DeviceError(code) => Err(DeviceError::DeviceReported {
            code: code.clone(),
            text: decoded.text.clone(),
        }),
        ReplyStatus::Malformed(reason) => Err(DeviceError::Malformed(reason.clone())),
    };
    for pending in matched {
        trace!(device = %shared.name, key = %decoded.key, call = pending.id, "resolved");
        pending.resolve(outcome.clone());
    }
}

fn expire(shared: &Shared, now: Instant) {
    let expired: Vec<(String, Pending)> = {
        let mut table = lock(&shared.table);
        let mut expired = Vec::new();
        table.pending.retain(|key, queue| {
            let mut kept = VecDeque::with_capacity(queue.len());
            for pending in queue.drain(..) {
                if pending.deadline <= now {
                    expired.push((key.clone(), pending));
                } else {
                    kept.push_back(pending);
                }
            }
            *queue = kept;
            !queue.is_empty()
        });
        expired
    };
    for (key, pending) in expired {
        debug!(device = %shared.name, %key, call = pending.id, "reply timed out");
        let after = pending.timeout;
        pending.resolve(Err(DeviceError::Timeout { key, after }));
    }
}
