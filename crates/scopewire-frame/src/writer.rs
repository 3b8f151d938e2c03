use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use scopewire_transport::IpcStream;

use crate::codec::{encode_frame, FrameConfig, FLAG_MORE};
use crate::error::{FrameError, Result};
use crate::message::MAX_PARTS;
use crate::reader::transport_to_frame_error;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames and messages to any `Write` stream.
///
/// All parts of a message are encoded into one buffer and written together,
/// so concurrent writers holding a lock around `send_message` never interleave
/// parts.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Send a single-part message.
    pub fn send(&mut self, channel: u16, payload: &[u8]) -> Result<()> {
        self.send_message(channel, &[payload])
    }

    /// Send one part, optionally announcing that more follow.
    pub fn send_part(&mut self, channel: u16, payload: &[u8], more: bool) -> Result<()> {
        self.check_size(payload)?;
        self.buf.clear();
        encode_frame(channel, if more { FLAG_MORE } else { 0 }, payload, &mut self.buf)?;
        self.write_buffered()
    }

    /// Send a multi-part message.
    pub fn send_message(&mut self, channel: u16, parts: &[&[u8]]) -> Result<()> {
        if parts.is_empty() {
            return Err(FrameError::EmptyMessage);
        }
        if parts.len() > MAX_PARTS {
            return Err(FrameError::TooManyParts { max: MAX_PARTS });
        }
        for part in parts {
            self.check_size(part)?;
        }

        self.buf.clear();
        let last = parts.len() - 1;
        for (index, part) in parts.iter().enumerate() {
            let flags = if index < last { FLAG_MORE } else { 0 };
            encode_frame(channel, flags, part, &mut self.buf)?;
        }
        self.write_buffered()
    }

    fn check_size(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }
        Ok(())
    }

    fn write_buffered(&mut self) -> Result<()> {
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame encoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }
}

impl FrameWriter<IpcStream> {
    /// Create a frame writer for `IpcStream` and apply the write timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}
