use std::sync::{Condvar, Mutex};
use std::time::Duration;

use scopewire_rpc::CancelToken;
use scopewire_socket::lock;

use crate::error::{DeviceError, Result};

/// Cancel checks happen at least this often while blocked.
const CANCEL_SLICE: Duration = Duration::from_millis(20);

/// A reply matched to the call that asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReply {
    pub key: String,
    pub text: String,
}

/// One-shot slot a caller blocks on until the worker fills it.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    outcome: Mutex<Option<Result<DeviceReply>>>,
    ready: Condvar,
}

impl Completion {
    /// First outcome wins. Returns whether this one was stored.
    pub(crate) fn complete(&self, outcome: Result<DeviceReply>) -> bool {
        let mut slot = lock(&self.outcome);
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.ready.notify_all();
        true
    }

    pub(crate) fn is_done(&self) -> bool {
        lock(&self.outcome).is_some()
    }

    pub(crate) fn peek(&self) -> Option<Result<DeviceReply>> {
        lock(&self.outcome).clone()
    }

    /// Block until completed or `cancel` fires.
    pub(crate) fn wait(&self, cancel: &CancelToken) -> Result<DeviceReply> {
        let mut slot = lock(&self.outcome);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            if cancel.is_cancelled() {
                return Err(DeviceError::Interrupted);
            }
            slot = self
                .ready
                .wait_timeout(slot, CANCEL_SLICE)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}
