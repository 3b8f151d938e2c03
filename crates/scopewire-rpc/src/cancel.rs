use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use scopewire_socket::lock;

use crate::error::Fault;

/// Cooperative cancellation flag shared between a running call and the
/// interrupt channel.
///
/// Clones observe the same flag. Blocking code polls [`check`](Self::check)
/// or sleeps through [`sleep`](Self::sleep), which wakes early on cancel.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake any sleeper. Returns `false` if it was already set.
    pub fn cancel(&self) -> bool {
        let mut cancelled = lock(&self.inner.cancelled);
        let first = !*cancelled;
        *cancelled = true;
        self.inner.wake.notify_all();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.inner.cancelled)
    }

    /// `Err(Interrupted)` once cancelled.
    pub fn check(&self) -> Result<(), Fault> {
        if self.is_cancelled() {
            Err(Fault::interrupted())
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless cancelled first.
    pub fn sleep(&self, duration: Duration) -> Result<(), Fault> {
        let deadline = Instant::now() + duration;
        let mut cancelled = lock(&self.inner.cancelled);
        while !*cancelled {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            cancelled = self
                .inner
                .wake
                .wait_timeout(cancelled, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        Err(Fault::interrupted())
    }
}
