/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x5357 \"SW\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A message carried more parts than allowed.
    #[error("too many message parts (max {max})")]
    TooManyParts { max: usize },

    /// Parts of one message arrived on different channels.
    #[error("message part on channel {got} interleaved with channel {expected}")]
    ChannelMismatch { expected: u16, got: u16 },

    /// A message must have at least one part.
    #[error("empty message")]
    EmptyMessage,

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True for read/write timeouts on a stream with a deadline set.
    ///
    /// Partial input stays buffered in the reader, so the call can be retried.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Io(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
