use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use scopewire_socket::lock;
use tracing::{debug, info, warn};

use crate::error::{BufferError, Result};
use crate::handle::SharedBuffer;
use crate::meta::BufferMeta;
use crate::region::{MappedBuffer, ShmRegion};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Name prefix for shared memory objects; the process id keeps it unique.
    pub prefix: String,
    /// Pending handoffs older than this are reclaimed by [`BufferRegistry::sweep_expired`].
    pub handoff_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prefix: format!("sw-{}", std::process::id()),
            handoff_ttl: Duration::from_secs(60),
        }
    }
}

/// Reference and handoff counts of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCounts {
    pub refcount: usize,
    pub pending: usize,
}

#[derive(Debug)]
struct Handoff {
    owner: String,
    since: Instant,
}

#[derive(Debug)]
struct Entry {
    meta: BufferMeta,
    refcount: usize,
    pending: Vec<Handoff>,
}

impl Entry {
    fn counts(&self) -> BufferCounts {
        BufferCounts {
            refcount: self.refcount,
            pending: self.pending.len(),
        }
    }
}

struct Inner {
    config: RegistryConfig,
    node: String,
    entries: Mutex<HashMap<String, Entry>>,
    torn_down: AtomicU64,
}

/// Server-side table of shared buffers.
///
/// Each buffer has two counters: `refcount` (holders inside this process)
/// and `pending` (handoffs to clients that have not confirmed yet). Every
/// decrement checks both under the table lock; the buffer is unlinked the
/// moment both are zero, exactly once.
#[derive(Clone)]
pub struct BufferRegistry {
    inner: Arc<Inner>,
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl BufferRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                node: scopewire_transport::node_name(),
                entries: Mutex::new(HashMap::new()),
                torn_down: AtomicU64::new(0),
            }),
        }
    }

    /// Host name clients compare against their own.
    pub fn node_name(&self) -> &str {
        &self.inner.node
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Allocate a zeroed buffer for `meta`. The returned handle holds refcount 1.
    pub fn create(&self, meta: BufferMeta) -> Result<SharedBuffer> {
        let mut attempts = 0;
        let mapping = loop {
            let name = format!(
                "/{}-{}",
                self.inner.config.prefix,
                NEXT_ID.fetch_add(1, Ordering::Relaxed)
            );
            match MappedBuffer::create(&name, meta.clone()) {
                Ok(mapping) => break mapping,
                Err(BufferError::Os { source, .. })
                    if source.kind() == std::io::ErrorKind::AlreadyExists && attempts < 8 =>
                {
                    attempts += 1;
                    debug!(%name, "stale shared memory name, trying the next one");
                }
                Err(err) => return Err(err),
            }
        };

        lock(&self.inner.entries).insert(
            mapping.name().to_string(),
            Entry {
                meta,
                refcount: 1,
                pending: Vec::new(),
            },
        );
        debug!(name = mapping.name(), bytes = mapping.data().len(), "buffer created");
        Ok(SharedBuffer::new(self.clone(), mapping))
    }

    /// Add one in-process reference.
    pub fn retain(&self, name: &str) -> Result<BufferCounts> {
        let mut entries = lock(&self.inner.entries);
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| BufferError::UnknownBuffer(name.to_string()))?;
        entry.refcount += 1;
        Ok(entry.counts())
    }

    /// Drop one in-process reference.
    pub fn release(&self, name: &str) -> Result<BufferCounts> {
        self.decrement(name, |entry| {
            if entry.refcount == 0 {
                return Err(BufferError::UnknownBuffer(name.to_string()));
            }
            entry.refcount -= 1;
            Ok(())
        })
    }

    /// Record a handoff to `owner`; the buffer survives until it is confirmed.
    pub fn register_for_transfer(&self, name: &str, owner: &str) -> Result<BufferCounts> {
        let mut entries = lock(&self.inner.entries);
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| BufferError::UnknownBuffer(name.to_string()))?;
        entry.pending.push(Handoff {
            owner: owner.to_string(),
            since: Instant::now(),
        });
        debug!(name, owner, pending = entry.pending.len(), "handoff registered");
        Ok(entry.counts())
    }

    /// `owner` confirmed it opened the buffer.
    pub fn release_pending(&self, name: &str, owner: &str) -> Result<BufferCounts> {
        self.decrement(name, |entry| {
            let index = entry
                .pending
                .iter()
                .position(|h| h.owner == owner)
                .ok_or_else(|| BufferError::NoPendingHandoff {
                    name: name.to_string(),
                    owner: owner.to_string(),
                })?;
            entry.pending.remove(index);
            Ok(())
        })
    }

    /// Drop every handoff held by `owner` (its connection is gone).
    pub fn reclaim_owner(&self, owner: &str) -> usize {
        self.reclaim(|h| h.owner == owner, "owner disconnected")
    }

    /// Drop handoffs older than the configured TTL.
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.inner.config.handoff_ttl;
        self.reclaim(|h| h.since.elapsed() >= ttl, "handoff expired")
    }

    fn reclaim(&self, stale: impl Fn(&Handoff) -> bool, reason: &str) -> usize {
        let mut reclaimed = 0;
        let mut dead = Vec::new();
        {
            let mut entries = lock(&self.inner.entries);
            for (name, entry) in entries.iter_mut() {
                let before = entry.pending.len();
                entry.pending.retain(|h| !stale(h));
                let dropped = before - entry.pending.len();
                if dropped > 0 {
                    reclaimed += dropped;
                    debug!(%name, dropped, reason, "pending handoffs reclaimed");
                    if entry.refcount == 0 && entry.pending.is_empty() {
                        dead.push(name.clone());
                    }
                }
            }
            for name in &dead {
                entries.remove(name);
            }
        }
        for name in dead {
            self.teardown(&name);
        }
        reclaimed
    }

    fn decrement(
        &self,
        name: &str,
        apply: impl FnOnce(&mut Entry) -> Result<()>,
    ) -> Result<BufferCounts> {
        let counts = {
            let mut entries = lock(&self.inner.entries);
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| BufferError::UnknownBuffer(name.to_string()))?;
            apply(entry)?;
            let counts = entry.counts();
            if counts.refcount == 0 && counts.pending == 0 {
                entries.remove(name);
            }
            counts
        };
        if counts.refcount == 0 && counts.pending == 0 {
            self.teardown(name);
        }
        Ok(counts)
    }

    // Called once per name: the entry was removed under the lock.
    fn teardown(&self, name: &str) {
        match ShmRegion::unlink(name) {
            Ok(()) => debug!(name, "buffer torn down"),
            Err(err) => warn!(name, error = %err, "unlink failed"),
        }
        self.inner.torn_down.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counts(&self, name: &str) -> Option<BufferCounts> {
        lock(&self.inner.entries).get(name).map(Entry::counts)
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.inner.entries).contains_key(name)
    }

    /// Live buffers.
    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffers unlinked so far.
    pub fn torn_down(&self) -> u64 {
        self.inner.torn_down.load(Ordering::Relaxed)
    }

    pub fn meta(&self, name: &str) -> Result<BufferMeta> {
        lock(&self.inner.entries)
            .get(name)
            .map(|entry| entry.meta.clone())
            .ok_or_else(|| BufferError::UnknownBuffer(name.to_string()))
    }

    /// Copy out the data of a live buffer.
    ///
    /// A reference is held while copying so a concurrent release cannot
    /// unlink the name in between.
    pub fn read_bytes(&self, name: &str) -> Result<(BufferMeta, Vec<u8>)> {
        self.retain(name)?;
        let copied = MappedBuffer::open(name).map(|mapping| (mapping.meta().clone(), mapping.data().to_vec()));
        self.release(name)?;
        copied
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` on a background thread.
    pub fn spawn_sweeper(&self, interval: Duration) -> std::io::Result<Sweeper> {
        let registry = self.clone();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("sw-buffer-sweep".to_string())
            .spawn(move || {
                let tick = interval.min(Duration::from_millis(100));
                let mut last = Instant::now();
                while flag.load(Ordering::SeqCst) {
                    std::thread::sleep(tick);
                    if last.elapsed() >= interval {
                        last = Instant::now();
                        let reclaimed = registry.sweep_expired();
                        if reclaimed > 0 {
                            info!(reclaimed, "expired handoffs reclaimed");
                        }
                    }
                }
            })?;
        Ok(Sweeper {
            running,
            thread: Some(thread),
        })
    }

    /// Unlink every live buffer regardless of counts. Used at shutdown.
    pub fn clear(&self) -> usize {
        let names: Vec<String> = lock(&self.inner.entries).drain().map(|(name, _)| name).collect();
        for name in &names {
            self.teardown(name);
        }
        names.len()
    }
}

/// Background sweeper; stops on drop.
pub struct Sweeper {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::ShmRegion;

    fn registry() -> BufferRegistry {
        BufferRegistry::new(RegistryConfig {
            prefix: format!("sw-reg-{}", std::process::id()),
            handoff_ttl: Duration::from_millis(50),
        })
    }

    #[test]
    fn handoff_keeps_buffer_alive_after_producer_release() {
        let registry = registry();
        let buffer = registry.create(BufferMeta::bytes(16)).unwrap();
        let name = buffer.name().to_string();

        registry.register_for_transfer(&name, "peer-1").unwrap();
        let counts = buffer.release().unwrap();
        assert_eq!(counts, BufferCounts { refcount: 0, pending: 1 });
        assert!(ShmRegion::exists(&name));

        registry.release_pending(&name, "peer-1").unwrap();
        assert!(!registry.contains(&name));
        assert!(!ShmRegion::exists(&name));
        assert_eq!(registry.torn_down(), 1);
    }

    #[test]
    fn confirmation_before_producer_release() {
        let registry = registry();
        let buffer = registry.create(BufferMeta::bytes(8)).unwrap();
        let name = buffer.name().to_string();
        registry.register_for_transfer(&name, "peer-1").unwrap();
        registry.release_pending(&name, "peer-1").unwrap();
        assert!(ShmRegion::exists(&name));
        drop(buffer);
        assert!(!ShmRegion::exists(&name));
    }

    #[test]
    fn release_pending_requires_a_handoff() {
        let registry = registry();
        let buffer = registry.create(BufferMeta::bytes(8)).unwrap();
        assert!(matches!(
            registry.release_pending(buffer.name(), "peer-9"),
            Err(BufferError::NoPendingHandoff { .. })
        ));
        assert!(matches!(
            registry.release_pending("/sw-missing", "peer-9"),
            Err(BufferError::UnknownBuffer(_))
        ));
    }

    #[test]
    fn disconnect_reclaims_only_that_owner() {
        let registry = registry();
        let buffer = registry.create(BufferMeta::bytes(8)).unwrap();
        let name = buffer.name().to_string();
        registry.register_for_transfer(&name, "peer-1").unwrap();
        registry.register_for_transfer(&name, "peer-2").unwrap();
        buffer.release().unwrap();

        assert_eq!(registry.reclaim_owner("peer-1"), 1);
        assert!(registry.contains(&name));
        assert_eq!(registry.reclaim_owner("peer-2"), 1);
        assert!(!registry.contains(&name));
        assert!(!ShmRegion::exists(&name));
    }

    #[test]
    fn sweep_reclaims_expired_handoffs() {
        let registry = registry();
        let buffer = registry.create(BufferMeta::bytes(8)).unwrap();
        let name = buffer.name().to_string();
        registry.register_for_transfer(&name, "peer-1").unwrap();
        buffer.release().unwrap();

        assert_eq!(registry.sweep_expired(), 0);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(registry.sweep_expired(), 1);
        assert!(!ShmRegion::exists(&name));
    }

    #[test]
    fn background_sweeper_reclaims() {
        let registry = registry();
        let buffer = registry.create(BufferMeta::bytes(8)).unwrap();
        let name = buffer.name().to_string();
        registry.register_for_transfer(&name, "peer-1").unwrap();
        buffer.release().unwrap();

        let _sweeper = registry.spawn_sweeper(Duration::from_millis(20)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.contains(&name) {
            assert!(Instant::now() < deadline, "sweeper never ran");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn read_bytes_copies_current_data() {
        let registry = registry();
        let mut buffer = registry.create(BufferMeta::bytes(4)).unwrap();
        buffer.write_at(0, &[9, 8, 7, 6]).unwrap();
        let (meta, data) = registry.read_bytes(buffer.name()).unwrap();
        assert_eq!(meta, BufferMeta::bytes(4));
        assert_eq!(data, vec![9, 8, 7, 6]);
        assert_eq!(registry.counts(buffer.name()).unwrap().refcount, 1);
    }
}
