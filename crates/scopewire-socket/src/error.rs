/// Errors that can occur in socket operations.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] scopewire_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] scopewire_frame::FrameError),

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer disconnected.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// No connected peer has this id.
    #[error("unknown peer '{0}'")]
    UnknownPeer(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// An earlier request timed out; its late reply would be mistaken for the next one.
    #[error("request socket is out of step with the server after a timeout")]
    Desynchronized,

    /// The socket has been shut down.
    #[error("socket closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SocketError>;
