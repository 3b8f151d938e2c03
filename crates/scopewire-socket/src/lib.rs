//! Messaging patterns for the scope daemon.
//!
//! Each connection starts with a handshake on the CONTROL channel in which
//! both sides declare their pattern and host name. On top of that:
//! - [`RequestSocket`] / [`ReplySocket`]: strictly alternating calls
//! - [`PublishSocket`] / [`SubscribeSocket`]: topic fan-out with prefix filters
//! - [`PushSocket`] / [`PullSocket`]: fire-and-forget signals
//!
//! Server-side sockets accept any number of peers. One worker thread per
//! socket polls every peer stream and funnels all traffic into one queue.

pub mod connection;
pub mod control;
pub mod error;
pub mod handshake;
mod hub;
pub mod pattern;
pub mod pubsub;
pub mod pushpull;
pub mod reqrep;
pub mod topic;

pub use connection::{Connection, PeerInfo, SocketConfig};
pub use control::ControlMessage;
pub use error::{Result, SocketError};
pub use handshake::{
    handshake_client, handshake_server, HandshakeConfig, HandshakeRequest, HandshakeResponse,
    HandshakeResult,
};
pub use pattern::Pattern;
pub use pubsub::{PublishSocket, SubscribeSocket, Subscription};
pub use pushpull::{PullSocket, PushSocket};
pub use reqrep::{Incoming, ReplySocket, RequestSocket};
pub use topic::matches_prefix;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
