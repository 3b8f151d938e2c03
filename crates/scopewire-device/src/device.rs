use std::sync::{Arc, Mutex};

use scopewire_rpc::CancelToken;
use scopewire_socket::lock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::completion::DeviceReply;
use crate::error::{DeviceError, Result};
use crate::manager::{MessageManager, PendingCall};

/// Calling convention of a device at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Each send blocks until its reply.
    #[default]
    Sync,
    /// Sends return at once; `wait` collects the outcomes.
    Async,
}

/// One logical device on a shared serial line.
///
/// The mode applies to sends made while it is set. Changing it leaves
/// calls already in flight alone.
pub struct AsyncDevice {
    name: String,
    manager: Arc<MessageManager>,
    mode: Mutex<Mode>,
    outstanding: Mutex<Vec<PendingCall>>,
}

impl AsyncDevice {
    pub fn new(name: impl Into<String>, manager: Arc<MessageManager>) -> Self {
        Self {
            name: name.into(),
            manager,
            mode: Mutex::new(Mode::Sync),
            outstanding: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &Arc<MessageManager> {
        &self.manager
    }

    pub fn mode(&self) -> Mode {
        *lock(&self.mode)
    }

    pub fn set_mode(&self, mode: Mode) {
        let mut current = lock(&self.mode);
        if *current != mode {
            debug!(device = %self.name, ?mode, "mode changed");
            *current = mode;
        }
    }

    /// Send in the current mode. The reply text comes back only in sync
    /// mode.
    pub fn send(&self, instruction: &str, cancel: &CancelToken) -> Result<Option<DeviceReply>> {
        self.send_with_mode(instruction, None, cancel)
    }

    /// Send with `mode` overriding the device's mode for this call.
    pub fn send_with_mode(
        &self,
        instruction: &str,
        mode: Option<Mode>,
        cancel: &CancelToken,
    ) -> Result<Option<DeviceReply>> {
        if cancel.is_cancelled() {
            return Err(DeviceError::Interrupted);
        }
        let mode = mode.unwrap_or_else(|| self.mode());
        let call = self.manager.send(instruction)?;
        match mode {
            Mode::Sync => call.wait(cancel).map(Some),
            Mode::Async => {
                lock(&self.outstanding).push(call);
                Ok(None)
            }
        }
    }

    /// Block until every async send since the last `wait` has resolved.
    ///
    /// Returns the first failure among them. When cancelled, calls not yet
    /// waited on stay outstanding for the next `wait`.
    pub fn wait(&self, cancel: &CancelToken) -> Result<()> {
        let calls = std::mem::take(&mut *lock(&self.outstanding));
        let mut first_error = None;
        let mut remaining = calls.into_iter();
        while let Some(call) = remaining.next() {
            match call.wait(cancel) {
                Ok(_) => {}
                Err(DeviceError::Interrupted) => {
                    let mut outstanding = lock(&self.outstanding);
                    let newer = std::mem::take(&mut *outstanding);
                    outstanding.push(call);
                    outstanding.extend(remaining);
                    outstanding.extend(newer);
                    return Err(DeviceError::Interrupted);
                }
                Err(err) => {
                    debug!(device = %self.name, key = call.key(), error = %err, "async call failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Whether any async send is still unresolved.
    pub fn has_pending(&self) -> bool {
        lock(&self.outstanding).iter().any(|call| !call.is_resolved())
    }
}

impl std::fmt::Debug for AsyncDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDevice")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .finish()
    }
}

/// Mode reported by a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    Sync,
    Async,
    /// Members disagree.
    Mixed,
}

/// Devices switched and waited on together, e.g. every axis of a stage.
#[derive(Debug, Default, Clone)]
pub struct DeviceGroup {
    members: Vec<Arc<AsyncDevice>>,
}

impl DeviceGroup {
    pub fn new(members: Vec<Arc<AsyncDevice>>) -> Self {
        Self { members }
    }

    pub fn push(&mut self, device: Arc<AsyncDevice>) {
        self.members.push(device);
    }

    pub fn members(&self) -> &[Arc<AsyncDevice>] {
        &self.members
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AsyncDevice>> {
        self.members.iter().find(|device| device.name() == name)
    }

    pub fn set_mode(&self, mode: Mode) {
        for device in &self.members {
            device.set_mode(mode);
        }
    }

    /// `None` for an empty group.
    pub fn mode(&self) -> Option<GroupMode> {
        let mut modes = self.members.iter().map(|device| device.mode());
        let first = modes.next()?;
        if modes.any(|mode| mode != first) {
            return Some(GroupMode::Mixed);
        }
        Some(match first {
            Mode::Sync => GroupMode::Sync,
            Mode::Async => GroupMode::Async,
        })
    }

    /// Wait on every member; the first failure wins. Cancellation stops at
    /// the member being waited on.
    pub fn wait(&self, cancel: &CancelToken) -> Result<()> {
        let mut first_error = None;
        for device in &self.members {
            match device.wait(cancel) {
                Ok(()) => {}
                Err(DeviceError::Interrupted) => return Err(DeviceError::Interrupted),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn has_pending(&self) -> bool {
        self.members.iter().any(|device| device.has_pending())
    }
}
