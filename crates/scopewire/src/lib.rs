//! Substrate for a microscope-control daemon.
//!
//! One daemon process owns the instruments. Clients reach it over a
//! request/reply RPC socket, abort long calls over a separate interrupt
//! socket, watch state changes on a property feed and receive large arrays
//! through shared memory when they run on the same host.
//!
//! # Crate Structure
//!
//! - [`transport`]: endpoints and byte streams (Unix sockets, TCP)
//! - [`frame`]: length-prefixed multi-part messages
//! - [`socket`]: request/reply, publish/subscribe and push/pull patterns
//! - [`rpc`]: command namespace, dispatcher, interrupts and client proxy
//! - [`buffer`]: shared buffer registry and local/remote data fetching
//! - [`property`]: property publisher, subscriber and heartbeats
//! - [`device`]: serial message manager and device calling conventions
//! - [`Daemon`]: everything above wired together, as run by `scoped serve`

pub mod builtins;
pub mod config;
pub mod daemon;
pub mod demo;

pub use config::{ConfigError, ScopeConfig};
pub use daemon::{Daemon, DaemonError, DaemonOptions, Endpoints};

/// Re-export transport types.
pub mod transport {
    pub use scopewire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use scopewire_frame::*;
}

/// Re-export messaging patterns.
pub mod socket {
    pub use scopewire_socket::*;
}

/// Re-export RPC types.
pub mod rpc {
    pub use scopewire_rpc::*;
}

/// Re-export shared buffer types.
pub mod buffer {
    pub use scopewire_buffer::*;
}

/// Re-export property feed types.
pub mod property {
    pub use scopewire_property::*;
}

/// Re-export serial device types.
pub mod device {
    pub use scopewire_device::*;
}
