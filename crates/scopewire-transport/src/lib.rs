//! Stream transports for the scope daemon.
//!
//! Provides a unified interface over the two ways clients reach a daemon:
//! - Unix domain sockets (same host)
//! - TCP (same host or across the lab network)
//!
//! This is the lowest layer of scopewire. Everything else builds on top of
//! the [`IpcStream`] and [`Listener`] types provided here.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod node;
pub mod stream;
pub mod tcp;

#[cfg(unix)]
pub mod uds;

pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use listener::{connect, connect_with_retry, Listener};
pub use node::node_name;
pub use stream::IpcStream;
pub use tcp::TcpSocket;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
