use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use scopewire_socket::{lock, PullSocket, SocketError};
use scopewire_transport::Endpoint;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::envelope::InterruptRequest;

struct Armed {
    call_id: Option<String>,
    token: CancelToken,
}

/// Listens on the interrupt socket and cancels the call currently armed.
///
/// At most one call is armed at a time. An interrupt cancels it at most
/// once; interrupts that arrive while nothing is armed, or that name a
/// different call, are dropped.
pub struct Interrupter {
    armed: Arc<Mutex<Option<Armed>>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    endpoint: Option<Endpoint>,
}

impl Interrupter {
    /// An interrupter with no socket; [`deliver`](Self::deliver) drives it directly.
    pub fn detached() -> Self {
        Self {
            armed: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            endpoint: None,
        }
    }

    /// Start a listener thread reading interrupts from `socket`.
    pub fn spawn(socket: PullSocket) -> scopewire_socket::Result<Self> {
        let mut interrupter = Self::detached();
        interrupter.endpoint = Some(socket.endpoint().clone());
        interrupter.running.store(true, Ordering::SeqCst);

        let armed = Arc::clone(&interrupter.armed);
        let running = Arc::clone(&interrupter.running);
        let thread = std::thread::Builder::new()
            .name("sw-interrupt".to_string())
            .spawn(move || listen(socket, &armed, &running))
            .map_err(|err| SocketError::Transport(err.into()))?;
        interrupter.thread = Some(thread);
        Ok(interrupter)
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Make `token` the target of interrupts until the guard drops.
    pub fn arm(&self, call_id: Option<&str>, token: &CancelToken) -> InterruptGuard<'_> {
        *lock(&self.armed) = Some(Armed {
            call_id: call_id.map(str::to_string),
            token: token.clone(),
        });
        InterruptGuard { slot: &self.armed }
    }

    /// Apply one interrupt. Returns whether a call was cancelled.
    pub fn deliver(&self, request: &InterruptRequest) -> bool {
        deliver(&self.armed, request)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Interrupter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Disarms on drop.
pub struct InterruptGuard<'a> {
    slot: &'a Mutex<Option<Armed>>,
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        lock(self.slot).take();
    }
}

fn deliver(slot: &Mutex<Option<Armed>>, request: &InterruptRequest) -> bool {
    let mut armed = lock(slot);
    let matches = match (armed.as_ref(), request.call_id.as_deref()) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(current), Some(wanted)) => current.call_id.as_deref() == Some(wanted),
    };
    if !matches {
        debug!(call_id = ?request.call_id, "interrupt discarded");
        return false;
    }
    match armed.take() {
        Some(current) => {
            info!(call_id = ?current.call_id, "interrupting call");
            current.token.cancel()
        }
        None => false,
    }
}

fn listen(socket: PullSocket, armed: &Mutex<Option<Armed>>, running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        match socket.recv_timeout(Duration::from_millis(50)) {
            Ok(Some((peer, message))) => {
                let parsed = message
                    .part(0)
                    .map(|part| serde_json::from_slice::<InterruptRequest>(part));
                match parsed {
                    Some(Ok(request)) => {
                        deliver(armed, &request);
                    }
                    _ => debug!(peer_id = %peer.peer_id, "malformed interrupt ignored"),
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "interrupt socket failed");
                break;
            }
        }
    }
}
