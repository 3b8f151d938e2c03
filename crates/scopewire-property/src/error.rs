/// Errors from property publishing and subscription.
#[derive(Debug, thiserror::Error)]
pub enum PropertyError {
    #[error("socket error: {0}")]
    Socket(#[from] scopewire_socket::SocketError),

    #[error("value does not serialize: {0}")]
    Json(#[from] serde_json::Error),

    #[error("publisher is stopped")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PropertyError>;
