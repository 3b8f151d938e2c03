use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use scopewire_socket::{PublishSocket, SubscribeSocket};
use scopewire_transport::Endpoint;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::update::{PropertyUpdate, HEARTBEAT_TOPIC};

fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Publishes the daemon's clock on the `heartbeat` topic at a fixed interval.
pub struct HeartbeatPublisher {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    endpoint: Endpoint,
}

impl HeartbeatPublisher {
    pub fn spawn(endpoint: &Endpoint, interval: Duration) -> Result<Self> {
        let mut socket = PublishSocket::bind(endpoint)?;
        let endpoint = socket.endpoint().clone();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("sw-heartbeat".to_string())
            .spawn(move || {
                let tick = interval.min(Duration::from_millis(50));
                let mut next = Instant::now();
                while flag.load(Ordering::SeqCst) {
                    if Instant::now() >= next {
                        next += interval;
                        let beat = PropertyUpdate {
                            name: HEARTBEAT_TOPIC.to_string(),
                            value: unix_time().into(),
                        };
                        let body = serde_json::to_vec(&beat).unwrap_or_default();
                        if let Err(err) = socket.publish(HEARTBEAT_TOPIC, &body) {
                            warn!(error = %err, "heartbeat socket failed");
                            break;
                        }
                    }
                    std::thread::sleep(tick);
                }
            })?;
        info!(%endpoint, interval_ms = interval.as_millis() as u64, "heartbeat started");
        Ok(Self {
            running,
            thread: Some(thread),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HeartbeatPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Watches a heartbeat feed and reports when it stops and resumes.
///
/// The daemon counts as lost after `max_missed` intervals without a beat,
/// or as soon as the feed connection drops. The monitor keeps trying to
/// reconnect, so a restarted daemon is reported as restored.
pub struct HeartbeatMonitor {
    running: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    beats: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    pub fn spawn<L, R>(
        endpoint: &Endpoint,
        interval: Duration,
        max_missed: u32,
        on_lost: L,
        on_restored: R,
    ) -> Result<Self>
    where
        L: Fn() + Send + 'static,
        R: Fn() + Send + 'static,
    {
        let socket = subscribe(endpoint)?;
        let running = Arc::new(AtomicBool::new(true));
        let alive = Arc::new(AtomicBool::new(true));
        let beats = Arc::new(AtomicU64::new(0));

        let state = Watch {
            endpoint: endpoint.clone(),
            grace: interval * max_missed.max(1),
            running: Arc::clone(&running),
            alive: Arc::clone(&alive),
            beats: Arc::clone(&beats),
        };
        let thread = std::thread::Builder::new()
            .name("sw-heartbeat-monitor".to_string())
            .spawn(move || state.run(Some(socket), on_lost, on_restored))?;
        Ok(Self {
            running,
            alive,
            beats,
            thread: Some(thread),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn subscribe(endpoint: &Endpoint) -> Result<SubscribeSocket> {
    let mut socket = SubscribeSocket::connect(endpoint)?;
    socket.subscribe(HEARTBEAT_TOPIC)?;
    Ok(socket)
}

struct Watch {
    endpoint: Endpoint,
    grace: Duration,
    running: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    beats: Arc<AtomicU64>,
}

impl Watch {
    fn run(self, mut socket: Option<SubscribeSocket>, on_lost: impl Fn(), on_restored: impl Fn()) {
        let poll = Duration::from_millis(50);
        let mut last_beat = Instant::now();
        let mut last_attempt = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            let Some(active) = socket.as_mut() else {
                if last_attempt.elapsed() >= self.grace {
                    last_attempt = Instant::now();
                    match subscribe(&self.endpoint) {
                        Ok(fresh) => {
                            debug!(endpoint = %self.endpoint, "heartbeat feed reconnected");
                            socket = Some(fresh);
                            last_beat = Instant::now();
                        }
                        Err(err) => debug!(error = %err, "heartbeat reconnect failed"),
                    }
                }
                std::thread::sleep(poll);
                continue;
            };

            match active.recv_timeout(poll) {
                Ok(Some(_)) => {
                    last_beat = Instant::now();
                    self.beats.fetch_add(1, Ordering::SeqCst);
                    if !self.alive.swap(true, Ordering::SeqCst) {
                        info!("heartbeat restored");
                        on_restored();
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(error = %err, "heartbeat feed dropped");
                    socket = None;
                    last_attempt = Instant::now();
                    self.mark_lost(&on_lost);
                    continue;
                }
            }
            if last_beat.elapsed() >= self.grace {
                self.mark_lost(&on_lost);
            }
        }
    }

    fn mark_lost(&self, on_lost: &impl Fn()) {
        if self.alive.swap(false, Ordering::SeqCst) {
            warn!(grace_ms = self.grace.as_millis() as u64, "heartbeat lost");
            on_lost();
        }
    }
}
