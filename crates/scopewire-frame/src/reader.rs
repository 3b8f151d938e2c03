use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};
use scopewire_transport::IpcStream;

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::message::{Message, MAX_PARTS};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Reads complete frames and messages from any `Read` stream.
///
/// Handles partial reads internally. When the stream has a read timeout and
/// it fires, the error is returned but everything read so far (including
/// earlier parts of a multi-part message) stays buffered for the next call.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
    scratch: Box<[u8]>,
    partial: Option<(u16, Vec<Bytes>)>,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            scratch: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            partial: None,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                return Ok(frame);
            }

            let read = match self.inner.read(&mut self.scratch) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&self.scratch[..read]);
        }
    }

    /// Read frames until a part without `FLAG_MORE` completes a message.
    pub fn read_message(&mut self) -> Result<Message> {
        loop {
            let frame = self.read_frame()?;
            if let Some(message) = self.assemble(frame)? {
                return Ok(message);
            }
        }
    }

    /// Read once from the stream into the internal buffer.
    ///
    /// For callers that learned from `poll` that the stream is readable, so
    /// the single read does not block. Nothing is decoded; follow up with
    /// [`buffered_message`](Self::buffered_message).
    pub fn fill(&mut self) -> Result<usize> {
        loop {
            match self.inner.read(&mut self.scratch) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(read) => {
                    self.buf.extend_from_slice(&self.scratch[..read]);
                    return Ok(read);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Next message that is complete in the buffer, without touching the stream.
    pub fn buffered_message(&mut self) -> Result<Option<Message>> {
        while let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
            if let Some(message) = self.assemble(frame)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    fn assemble(&mut self, frame: Frame) -> Result<Option<Message>> {
        let (channel, mut parts) = match self.partial.take() {
            Some((channel, parts)) => {
                if channel != frame.channel {
                    return Err(FrameError::ChannelMismatch {
                        expected: channel,
                        got: frame.channel,
                    });
                }
                (channel, parts)
            }
            None => (frame.channel, Vec::new()),
        };

        if parts.len() >= MAX_PARTS {
            return Err(FrameError::TooManyParts { max: MAX_PARTS });
        }

        let more = frame.has_more();
        parts.push(frame.payload);
        if !more {
            return Ok(Some(Message::new(channel, parts)));
        }
        self.partial = Some((channel, parts));
        Ok(None)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<IpcStream> {
    /// Create a frame reader for `IpcStream` and apply the read timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the read timeout of the underlying stream.
    pub fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner
            .set_read_timeout(timeout)
            .map_err(transport_to_frame_error)?;
        self.config.read_timeout = timeout;
        Ok(())
    }
}

pub(crate) fn transport_to_frame_error(err: scopewire_transport::TransportError) -> FrameError {
    use scopewire_transport::TransportError;
    match err {
        TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
        TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
            FrameError::Io(source)
        }
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
