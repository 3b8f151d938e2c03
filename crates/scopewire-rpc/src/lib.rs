//! Remote procedure calls for the scope daemon.
//!
//! The server side is a frozen [`Namespace`] of commands, built from
//! explicitly registered handlers and [`Capability`] objects, served by a
//! [`Dispatcher`] on a [`ReplySocket`](scopewire_socket::ReplySocket).
//! Every call produces exactly one [`Reply`]: a value, raw bytes, or a
//! structured [`Fault`].
//!
//! A second socket carries interrupts. The [`Interrupter`] cancels the
//! [`CancelToken`] of the call currently running, which handlers observe at
//! their next blocking checkpoint.
//!
//! On the client, [`RpcClient`] sends calls and [`Proxy`] builds stubs from
//! the server's `__describe__` listing.

pub mod cancel;
pub mod client;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod interrupt;
pub mod namespace;
pub mod proxy;
pub mod signature;

pub use cancel::CancelToken;
pub use client::{InterruptHandle, RpcClient};
pub use dispatcher::Dispatcher;
pub use envelope::{CallEnvelope, InterruptRequest, Reply, TAG_BINARY, TAG_ERROR, TAG_VALUE};
pub use error::{ErrorKind, Fault, RpcError};
pub use interrupt::{InterruptGuard, Interrupter};
pub use namespace::{
    Call, CallContext, Capability, Command, CommandDescriptor, Handler, Namespace,
    DisconnectHook, NamespaceBuilder, Output, Scope, Transferable, DESCRIBE,
};
pub use proxy::{NamespaceView, PropertyStub, Proxy, Stub};
pub use signature::{Param, Signature};

/// Result alias for client-side operations.
pub type Result<T> = std::result::Result<T, RpcError>;
