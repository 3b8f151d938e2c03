//! Serial device plumbing for the scope daemon.
//!
//! A [`MessageManager`] owns one serial line. It writes instructions in the
//! order they are sent and matches each reply to its call by a key the
//! line's [`Protocol`] extracts, so devices that answer out of order or
//! interleave status events still resolve the right call.
//!
//! [`AsyncDevice`] layers the two calling conventions on top: sync sends
//! block for their reply, async sends return at once and are collected by
//! [`AsyncDevice::wait`].

pub mod channel;
mod completion;
pub mod device;
pub mod echo;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod serial;

pub use channel::{loopback, LineChannel, ReadTimeout, SerialChannel};
pub use completion::DeviceReply;
pub use device::{AsyncDevice, DeviceGroup, GroupMode, Mode};
pub use echo::{EchoDevice, EchoResponder};
pub use error::{DeviceError, Result};
pub use manager::{
    Listener, ListenerId, ManagerConfig, MessageManager, PendingCall, ReplyCallback,
};
pub use protocol::{Decoded, EchoProtocol, Encoded, HeaderProtocol, Protocol, ReplyStatus};
pub use serial::{open_serial_port, SerialPort};
