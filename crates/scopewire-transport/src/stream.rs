use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::error::Result;

/// A connected stream: implements Read + Write.
///
/// This is the fundamental I/O type returned by transport operations.
/// It wraps either a Unix domain socket stream or a TCP stream.
pub struct IpcStream {
    inner: IpcStreamInner,
}

enum IpcStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    Tcp(TcpStream),
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.read(buf),
            IpcStreamInner::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.write(buf),
            IpcStreamInner::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.flush(),
            IpcStreamInner::Tcp(stream) => stream.flush(),
        }
    }
}

impl IpcStream {
    /// Create an IpcStream from a Unix domain socket stream.
    #[cfg(unix)]
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: IpcStreamInner::Unix(stream),
        }
    }

    /// Create an IpcStream from a TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            inner: IpcStreamInner::Tcp(stream),
        }
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            IpcStreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            IpcStreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Switch between blocking and non-blocking I/O.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_nonblocking(nonblocking).map_err(Into::into),
            IpcStreamInner::Tcp(stream) => stream.set_nonblocking(nonblocking).map_err(Into::into),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
            IpcStreamInner::Tcp(stream) => Ok(Self::from_tcp(stream.try_clone()?)),
        }
    }

    /// Shut down both halves of the connection.
    ///
    /// Readers blocked on a clone of this stream observe EOF.
    pub fn shutdown(&self) -> Result<()> {
        let result = match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.shutdown(Shutdown::Both),
            IpcStreamInner::Tcp(stream) => stream.shutdown(Shutdown::Both),
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// True when both ends necessarily share a host.
    ///
    /// Unix domain sockets always do; TCP streams do when the peer address is
    /// a loopback address.
    pub fn is_loopback(&self) -> bool {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(_) => true,
            IpcStreamInner::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.ip().is_loopback())
                .unwrap_or(false),
        }
    }

    /// Human-readable peer address for logs.
    pub fn peer_label(&self) -> String {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(_) => "unix".to_string(),
            IpcStreamInner::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(_) => "unix-domain-socket",
            IpcStreamInner::Tcp(_) => "tcp",
        }
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcStream")
            .field("type", &self.transport_name())
            .finish()
    }
}

#[cfg(unix)]
impl std::os::fd::AsRawFd for IpcStream {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        match &self.inner {
            IpcStreamInner::Unix(stream) => std::os::fd::AsRawFd::as_raw_fd(stream),
            IpcStreamInner::Tcp(stream) => std::os::fd::AsRawFd::as_raw_fd(stream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn unix_pair_is_loopback() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let left = IpcStream::from_unix(left);
        let _right = IpcStream::from_unix(right);
        assert!(left.is_loopback());
        assert_eq!(left.transport_name(), "unix-domain-socket");
    }

    #[test]
    fn tcp_localhost_is_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = IpcStream::from_tcp(TcpStream::connect(addr).unwrap());
        let (_server, _) = listener.accept().unwrap();
        assert!(client.is_loopback());
        assert!(client.peer_label().starts_with("127.0.0.1:"));
    }

    #[test]
    fn shutdown_wakes_blocked_reader() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let left = IpcStream::from_unix(left);
        let mut reader = left.try_clone().unwrap();
        let _right = right;

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf).unwrap()
        });

        std::thread::sleep(Duration::from_millis(20));
        left.shutdown().unwrap();
        assert_eq!(handle.join().unwrap(), 0);
    }
}
