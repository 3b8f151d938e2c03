//! Byte channels the message manager reads replies from.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// A half-duplex line to a device.
///
/// Only the manager's worker thread touches a channel, so implementations
/// need `Send` but not `Sync`.
pub trait SerialChannel: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Next complete reply without its terminator, or `None` when none
    /// completed within `poll`. A lost line is `Err(UnexpectedEof)`; a reply
    /// that outgrew the channel's limit is `Err(InvalidData)` and was
    /// discarded, leaving the line usable.
    fn read_reply(&mut self, poll: Duration) -> io::Result<Option<Vec<u8>>>;

    fn describe(&self) -> String;
}

/// Streams whose reads can be bounded in time.
pub trait ReadTimeout {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl ReadTimeout for UnixStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }
}

/// Longest reply a [`LineChannel`] buffers by default while waiting for
/// its terminator.
pub const DEFAULT_MAX_REPLY: usize = 64 * 1024;

/// Terminator-delimited replies over any byte stream.
///
/// Bytes of an incomplete reply are kept across polls, up to a limit.
#[derive(Debug)]
pub struct LineChannel<T> {
    inner: T,
    terminator: Vec<u8>,
    buffer: Vec<u8>,
    max_reply: usize,
    timeout: Option<Duration>,
    label: String,
}

impl<T> LineChannel<T>
where
    T: Read + Write + ReadTimeout + Send,
{
    pub fn new(inner: T, terminator: &[u8], label: impl Into<String>) -> Self {
        Self {
            inner,
            terminator: terminator.to_vec(),
            buffer: Vec::new(),
            max_reply: DEFAULT_MAX_REPLY,
            timeout: None,
            label: label.into(),
        }
    }

    pub fn with_max_reply(mut self, max_reply: usize) -> Self {
        self.max_reply = max_reply.max(1);
        self
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        if self.terminator.is_empty() {
            return None;
        }
        let end = self
            .buffer
            .windows(self.terminator.len())
            .position(|window| window == self.terminator.as_slice())?;
        let mut line: Vec<u8> = self.buffer.drain(..end + self.terminator.len()).collect();
        line.truncate(end);
        Some(line)
    }
}

impl<T> SerialChannel for LineChannel<T>
where
    T: Read + Write + ReadTimeout + Send,
{
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.inner.flush()
    }

    fn read_reply(&mut self, poll: Duration) -> io::Result<Option<Vec<u8>>> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }
        // Zero means "block forever" to most streams.
        let poll = poll.max(Duration::from_millis(1));
        if self.timeout != Some(poll) {
            self.inner.set_read_timeout(Some(poll))?;
            self.timeout = Some(poll);
        }

        // One read per poll, so a device that never stops talking cannot
        // keep the caller from its write queue.
        let mut scratch = [0u8; 512];
        let n = loop {
            match self.inner.read(&mut scratch) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} closed", self.label),
                    ))
                }
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None)
                }
                Err(err) => return Err(err),
            }
        };
        self.buffer.extend_from_slice(&scratch[..n]);
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }
        if self.buffer.len() > self.max_reply {
            let dropped = self.buffer.len();
            self.buffer.clear();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{}: {dropped} bytes without a terminator, limit is {}",
                    self.label, self.max_reply
                ),
            ));
        }
        Ok(None)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// In-process line: the manager's end plus the far end a simulated device
/// reads and answers on.
pub fn loopback(terminator: &[u8]) -> io::Result<(LineChannel<UnixStream>, UnixStream)> {
    let (near, far) = UnixStream::pair()?;
    Ok((LineChannel::new(near, terminator, "loopback"), far))
}
