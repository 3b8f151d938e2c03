use std::fmt;
use std::io;

use scopewire::{ConfigError, DaemonError};
use scopewire_buffer::BufferError;
use scopewire_property::PropertyError;
use scopewire_rpc::{ErrorKind, Fault, RpcError};
use scopewire_socket::SocketError;
use scopewire_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;
pub const INTERRUPTED: i32 = 130;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidEndpoint { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn socket_error(context: &str, err: SocketError) -> CliError {
    match err {
        SocketError::Transport(err) => transport_error(context, err),
        SocketError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        SocketError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        SocketError::HandshakeFailed(_) | SocketError::Disconnected(_) | SocketError::Closed => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn fault_error(context: &str, fault: &Fault) -> CliError {
    let code = match fault.kind {
        ErrorKind::Timeout => TIMEOUT,
        ErrorKind::Interrupted => INTERRUPTED,
        ErrorKind::BadRequest => USAGE,
        ErrorKind::Malformed => DATA_INVALID,
        ErrorKind::DeviceDisconnected => TRANSPORT_ERROR,
        ErrorKind::NotFound | ErrorKind::RuntimeFault => FAILURE,
    };
    CliError::new(code, format!("{context}: {fault}"))
}

pub fn rpc_error(context: &str, err: RpcError) -> CliError {
    match err {
        RpcError::Socket(err) => socket_error(context, err),
        RpcError::Remote(fault) => fault_error(context, &fault),
        RpcError::Arguments { .. } | RpcError::UnknownCommand(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        RpcError::Json(_) | RpcError::Protocol(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn buffer_error(context: &str, err: BufferError) -> CliError {
    match err {
        BufferError::Rpc(err) => rpc_error(context, err),
        BufferError::Io(err) => io_error(context, err),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn property_error(context: &str, err: PropertyError) -> CliError {
    match err {
        PropertyError::Socket(err) => socket_error(context, err),
        PropertyError::Io(err) => io_error(context, err),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn config_error(err: ConfigError) -> CliError {
    match err {
        ConfigError::Read { source, .. } if source.kind() != io::ErrorKind::NotFound => {
            io_error("config", source)
        }
        other => CliError::new(USAGE, other.to_string()),
    }
}

pub fn daemon_error(context: &str, err: DaemonError) -> CliError {
    match err {
        DaemonError::Socket(err) => socket_error(context, err),
        DaemonError::Property(err) => property_error(context, err),
        DaemonError::Io(err) => io_error(context, err),
        DaemonError::Rpc(err) => CliError::new(INTERNAL, format!("{context}: {err}")),
    }
}
