use scopewire_rpc::{ErrorKind, Fault, RpcError};

/// Errors from shared-buffer operations.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("{op} failed for '{name}': {source}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no shared buffer named '{0}'")]
    UnknownBuffer(String),

    #[error("'{owner}' has no pending handoff of '{name}'")]
    NoPendingHandoff { name: String, owner: String },

    #[error("invalid buffer header: {0}")]
    InvalidHeader(String),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    Size { expected: usize, actual: usize },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
}

pub type Result<T> = std::result::Result<T, BufferError>;

impl From<BufferError> for Fault {
    fn from(err: BufferError) -> Self {
        let kind = match &err {
            BufferError::UnknownBuffer(_) | BufferError::NoPendingHandoff { .. } => {
                ErrorKind::NotFound
            }
            BufferError::Size { .. } | BufferError::Unsupported(_) => ErrorKind::BadRequest,
            _ => ErrorKind::RuntimeFault,
        };
        Fault::new(kind, err.to_string())
    }
}
