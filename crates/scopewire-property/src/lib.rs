//! Property feed for the scope daemon.
//!
//! The daemon keeps the current value of every observable property in a
//! [`PropertyPublisher`]. Each change is queued and sent by the publisher's
//! own thread as `[name, {"name", "value"}]`, so device code never blocks
//! on sockets. Clients use a [`PropertySubscriber`] to mirror the values and
//! run callbacks registered for an exact name or a dotted prefix.
//!
//! A separate heartbeat feed lets clients notice a dead daemon.

pub mod error;
pub mod heartbeat;
pub mod publisher;
pub mod subscriber;
pub mod update;

pub use error::{PropertyError, Result};
pub use heartbeat::{HeartbeatMonitor, HeartbeatPublisher};
pub use publisher::{LateJoin, Observable, PropertyHandle, PropertyPublisher, PublisherConfig};
pub use subscriber::{PropertyCallback, PropertySubscriber, SubscriptionId};
pub use update::{PropertyUpdate, HEARTBEAT_TOPIC};
