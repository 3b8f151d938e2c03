//! One poll-driven worker per server socket.
//!
//! The worker accepts clients, runs their handshakes and reads every peer
//! stream, funnelling all of it into a single event queue. Writes happen on
//! the caller's thread through the shared writer table.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use scopewire_frame::{FrameError, FrameReader, FrameWriter, Message};
use scopewire_transport::{Endpoint, IpcStream, Listener};
use tracing::{debug, info, warn};

use crate::connection::{Connection, PeerInfo, SocketConfig};
use crate::error::{Result, SocketError};
use crate::lock;
use crate::pattern::Pattern;

pub(crate) enum HubEvent {
    Joined(Arc<PeerInfo>),
    Message(Arc<PeerInfo>, Message),
    Left(Arc<PeerInfo>),
}

struct PeerWriter {
    info: Arc<PeerInfo>,
    writer: FrameWriter<IpcStream>,
}

struct HubShared {
    running: AtomicBool,
    writers: Mutex<HashMap<String, PeerWriter>>,
}

pub(crate) struct Hub {
    shared: Arc<HubShared>,
    events: Receiver<HubEvent>,
    worker: Option<JoinHandle<()>>,
    endpoint: Endpoint,
}

impl Hub {
    pub(crate) fn bind(endpoint: &Endpoint, pattern: Pattern, config: SocketConfig) -> Result<Self> {
        let listener = Listener::bind(endpoint)?;
        listener.set_nonblocking(true)?;
        let endpoint = listener.endpoint();

        let shared = Arc::new(HubShared {
            running: AtomicBool::new(true),
            writers: Mutex::new(HashMap::new()),
        });
        let (tx, events) = mpsc::channel();

        let worker = Worker {
            listener,
            pattern,
            config,
            shared: Arc::clone(&shared),
            tx,
            next_id: 1,
            waiting: Vec::new(),
            peers: Vec::new(),
        };
        let worker = std::thread::Builder::new()
            .name(format!("sw-{}-hub", pattern.as_str()))
            .spawn(move || worker.run())
            .map_err(|err| SocketError::Transport(err.into()))?;

        info!(%endpoint, pattern = pattern.as_str(), "socket bound");
        Ok(Self {
            shared,
            events,
            worker: Some(worker),
            endpoint,
        })
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Result<Option<HubEvent>> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SocketError::Closed),
        }
    }

    pub(crate) fn try_event(&self) -> Result<Option<HubEvent>> {
        match self.events.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SocketError::Closed),
        }
    }

    /// Send to one peer. A peer whose write fails is dropped.
    pub(crate) fn send(&self, peer_id: &str, channel: u16, parts: &[&[u8]]) -> Result<()> {
        let mut writers = lock(&self.shared.writers);
        let entry = writers
            .get_mut(peer_id)
            .ok_or_else(|| SocketError::UnknownPeer(peer_id.to_string()))?;
        if let Err(err) = entry.writer.send_message(channel, parts) {
            debug!(peer_id, error = %err, "dropping peer after failed write");
            if let Some(dead) = writers.remove(peer_id) {
                let _ = dead.writer.get_ref().shutdown();
            }
            return Err(err.into());
        }
        Ok(())
    }

    pub(crate) fn peers(&self) -> Vec<Arc<PeerInfo>> {
        lock(&self.shared.writers)
            .values()
            .map(|entry| Arc::clone(&entry.info))
            .collect()
    }

    pub(crate) fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        for entry in lock(&self.shared.writers).values() {
            let _ = entry.writer.get_ref().shutdown();
        }
        debug!(endpoint = %self.endpoint, "socket shut down");
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Accepted, hello not yet readable.
struct Waiting {
    peer_id: String,
    stream: IpcStream,
    since: Instant,
}

struct Peer {
    info: Arc<PeerInfo>,
    reader: FrameReader<IpcStream>,
}

struct Worker {
    listener: Listener,
    pattern: Pattern,
    config: SocketConfig,
    shared: Arc<HubShared>,
    tx: Sender<HubEvent>,
    next_id: u64,
    waiting: Vec<Waiting>,
    peers: Vec<Peer>,
}

impl Worker {
    fn run(mut self) {
        let mut fds = Vec::new();
        while self.shared.running.load(Ordering::SeqCst) {
            // Layout: listener, then waiting clients, then joined peers.
            fds.clear();
            fds.push(readable(self.listener.as_raw_fd()));
            fds.extend(self.waiting.iter().map(|w| readable(w.stream.as_raw_fd())));
            fds.extend(self.peers.iter().map(|p| readable(p.reader.get_ref().as_raw_fd())));

            match wait(&mut fds, self.config.poll_interval) {
                Ok(0) => {}
                Ok(_) => {
                    let peer_base = 1 + self.waiting.len();
                    // Reverse order keeps the indices of unvisited entries valid
                    // across swap_remove.
                    for index in (0..self.peers.len()).rev() {
                        if fds[peer_base + index].revents != 0 && !self.read_peer(index) {
                            let peer = self.peers.swap_remove(index);
                            self.leave(peer);
                        }
                    }
                    for index in (0..self.waiting.len()).rev() {
                        if fds[1 + index].revents != 0 {
                            let waiting = self.waiting.swap_remove(index);
                            self.admit(waiting);
                        }
                    }
                    if fds[0].revents != 0 {
                        self.accept_all();
                    }
                }
                Err(err) => {
                    warn!(error = %err, "poll failed");
                    std::thread::sleep(self.config.poll_interval);
                }
            }
            self.expire_waiting();
        }

        for peer in std::mem::take(&mut self.peers) {
            self.leave(peer);
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.try_accept() {
                Ok(Some(stream)) => {
                    let peer_id = format!("peer-{}", self.next_id);
                    self.next_id += 1;
                    self.waiting.push(Waiting {
                        peer_id,
                        stream,
                        since: Instant::now(),
                    });
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    std::thread::sleep(self.config.poll_interval);
                    return;
                }
            }
        }
    }

    fn expire_waiting(&mut self) {
        let timeout = self.config.handshake.timeout;
        self.waiting.retain(|waiting| {
            let alive = waiting.since.elapsed() < timeout;
            if !alive {
                debug!(peer_id = %waiting.peer_id, "client sent no hello");
            }
            alive
        });
    }

    /// Handshake a client whose hello has started to arrive.
    ///
    /// A client that stalls mid-hello holds the worker for at most the
    /// handshake timeout.
    fn admit(&mut self, waiting: Waiting) {
        let Waiting {
            peer_id, stream, ..
        } = waiting;
        let connection = match Connection::accept(stream, self.pattern, &peer_id, &self.config) {
            Ok(connection) => connection,
            Err(err) => {
                warn!(peer_id = %peer_id, error = %err, "handshake rejected");
                return;
            }
        };
        let (info, mut reader, writer) = connection.into_parts();
        if let Err(err) = reader.set_read_timeout(Some(self.config.poll_interval)) {
            warn!(peer_id = %peer_id, error = %err, "cannot set read timeout");
            return;
        }
        let info = Arc::new(info);

        lock(&self.shared.writers).insert(
            peer_id.clone(),
            PeerWriter {
                info: Arc::clone(&info),
                writer,
            },
        );
        debug!(peer_id = %peer_id, node = %info.node, local = info.local, "peer joined");
        if self.tx.send(HubEvent::Joined(Arc::clone(&info))).is_err() {
            return;
        }

        let mut peer = Peer { info, reader };
        // Requests sent right behind the hello are already buffered.
        if drain(&self.tx, &mut peer) {
            self.peers.push(peer);
        } else {
            self.leave(peer);
        }
    }

    /// Read what a ready peer sent. False once the peer is gone.
    fn read_peer(&mut self, index: usize) -> bool {
        let peer = &mut self.peers[index];
        match peer.reader.fill() {
            Ok(_) => drain(&self.tx, peer),
            Err(err) if err.is_timeout() => true,
            Err(FrameError::ConnectionClosed) => false,
            Err(err) => {
                debug!(peer_id = %peer.info.peer_id, error = %err, "peer read failed");
                false
            }
        }
    }

    fn leave(&self, peer: Peer) {
        lock(&self.shared.writers).remove(&peer.info.peer_id);
        debug!(peer_id = %peer.info.peer_id, "peer left");
        let _ = self.tx.send(HubEvent::Left(peer.info));
    }
}

/// Forward every complete buffered message. False once the peer must go.
fn drain(tx: &Sender<HubEvent>, peer: &mut Peer) -> bool {
    loop {
        match peer.reader.buffered_message() {
            Ok(Some(message)) => {
                if tx.send(HubEvent::Message(Arc::clone(&peer.info), message)).is_err() {
                    return false;
                }
            }
            Ok(None) => return true,
            Err(err) => {
                debug!(peer_id = %peer.info.peer_id, error = %err, "peer sent a bad frame");
                return false;
            }
        }
    }
}

fn readable(fd: std::os::fd::RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

/// Block until a descriptor is ready or `timeout` passes; returns the ready count.
fn wait(fds: &mut [libc::pollfd], timeout: Duration) -> std::io::Result<usize> {
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    // SAFETY: `fds` is a live slice and the count passed matches its length.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(usize::try_from(rc).unwrap_or(0))
}
