use serde::{Deserialize, Serialize};

/// Classification carried by every error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No command at the requested path.
    NotFound,
    /// The command failed while running.
    RuntimeFault,
    /// The call was cancelled through the interrupt channel.
    Interrupted,
    /// No matching device reply arrived in time.
    Timeout,
    /// A device reply did not parse or matched nothing.
    Malformed,
    /// The serial line behind a device was lost.
    DeviceDisconnected,
    /// The envelope or its arguments did not fit the command.
    BadRequest,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::RuntimeFault => "RuntimeFault",
            Self::Interrupted => "Interrupted",
            Self::Timeout => "Timeout",
            Self::Malformed => "Malformed",
            Self::DeviceDisconnected => "DeviceDisconnected",
            Self::BadRequest => "BadRequest",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an `error` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub detail: String,
}

impl Fault {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("no command at '{path}'"))
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeFault, message)
    }

    pub fn interrupted() -> Self {
        Self::new(ErrorKind::Interrupted, "call interrupted")
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }
}

impl From<serde_json::Error> for Fault {
    fn from(err: serde_json::Error) -> Self {
        Self::runtime(format!("serialization failed: {err}"))
    }
}

/// Errors seen by an RPC client.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("socket error: {0}")]
    Socket(#[from] scopewire_socket::SocketError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server answered with an error reply.
    #[error("remote {0}")]
    Remote(#[from] Fault),

    /// The reply did not follow the `[tag, body]` layout.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A stub was called with arguments its signature rejects.
    #[error("invalid arguments for '{path}': {reason}")]
    Arguments { path: String, reason: String },

    /// The proxy has no command at this path.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Two commands were registered at the same path.
    #[error("command '{0}' registered twice")]
    DuplicateCommand(String),
}

impl RpcError {
    /// The fault kind when the server answered with an error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Remote(fault) => Some(fault.kind),
            _ => None,
        }
    }
}
