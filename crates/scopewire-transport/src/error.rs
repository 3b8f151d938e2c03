/// Errors raised while binding, accepting or connecting a daemon endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The listener could not be bound. `endpoint` is rendered as `tcp://` or `ipc://`.
    #[error("cannot listen on {endpoint}: {source}")]
    Bind {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("cannot reach {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(std::io::Error),

    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),

    /// `sun_path` holds at most `max` bytes including the terminator.
    #[error("socket path {path} is {len} bytes, limit is {max}")]
    PathTooLong {
        path: std::path::PathBuf,
        len: usize,
        max: usize,
    },

    #[error("bad endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("{0} not available on this platform")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, TransportError>;
