use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::IpcStream;
use crate::tcp::TcpSocket;

#[cfg(unix)]
use crate::uds::UnixDomainSocket;

/// A bound listener for either transport.
pub enum Listener {
    #[cfg(unix)]
    Unix(UnixDomainSocket),
    Tcp(TcpSocket),
}

impl Listener {
    /// Bind to `endpoint`.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => Ok(Self::Tcp(TcpSocket::bind(host, *port)?)),
            #[cfg(unix)]
            Endpoint::Ipc(path) => Ok(Self::Unix(UnixDomainSocket::bind(path)?)),
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => Err(TransportError::Unsupported("unix domain sockets")),
        }
    }

    /// Accept an incoming connection.
    pub fn accept(&self) -> Result<IpcStream> {
        match self {
            #[cfg(unix)]
            Self::Unix(socket) => socket.accept(),
            Self::Tcp(socket) => socket.accept(),
        }
    }

    /// Accept a waiting connection without blocking.
    pub fn try_accept(&self) -> Result<Option<IpcStream>> {
        match self {
            #[cfg(unix)]
            Self::Unix(socket) => socket.try_accept(),
            Self::Tcp(socket) => socket.try_accept(),
        }
    }

    /// Switch between blocking and non-blocking accept.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(socket) => socket.set_nonblocking(nonblocking),
            Self::Tcp(socket) => socket.set_nonblocking(nonblocking),
        }
    }

    /// The endpoint clients should connect to.
    pub fn endpoint(&self) -> Endpoint {
        match self {
            #[cfg(unix)]
            Self::Unix(socket) => Endpoint::ipc(socket.path()),
            Self::Tcp(socket) => socket.endpoint(),
        }
    }
}

#[cfg(unix)]
impl std::os::fd::AsRawFd for Listener {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        match self {
            Self::Unix(socket) => std::os::fd::AsRawFd::as_raw_fd(socket),
            Self::Tcp(socket) => std::os::fd::AsRawFd::as_raw_fd(socket),
        }
    }
}

/// Connect to a listening endpoint.
pub fn connect(endpoint: &Endpoint) -> Result<IpcStream> {
    match endpoint {
        Endpoint::Tcp { host, port } => TcpSocket::connect(host, *port),
        #[cfg(unix)]
        Endpoint::Ipc(path) => UnixDomainSocket::connect(path),
        #[cfg(not(unix))]
        Endpoint::Ipc(_) => Err(TransportError::Connect {
            endpoint: endpoint.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix domain sockets are not available",
            ),
        }),
    }
}

/// Connect, retrying while the listener is not up yet.
pub fn connect_with_retry(endpoint: &Endpoint, attempts: usize) -> Result<IpcStream> {
    let mut last = None;
    for _ in 0..attempts.max(1) {
        match connect(endpoint) {
            Ok(stream) => return Ok(stream),
            Err(err) => last = Some(err),
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    Err(last.unwrap_or_else(|| TransportError::Connect {
        endpoint: endpoint.to_string(),
        source: std::io::Error::from(std::io::ErrorKind::NotConnected),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn ipc_endpoint_roundtrip() {
        let dir = std::env::temp_dir().join(format!(
            "scopewire-listener-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let endpoint = Endpoint::ipc(dir.join("l.sock"));

        let listener = Listener::bind(&endpoint).unwrap();
        assert_eq!(listener.endpoint(), endpoint);

        let target = listener.endpoint();
        let client = std::thread::spawn(move || {
            let mut stream = connect(&target).unwrap();
            stream.write_all(b"ok").unwrap();
        });
        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");
        client.join().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tcp_endpoint_reports_bound_port() {
        let listener = Listener::bind(&Endpoint::tcp("127.0.0.1", 0)).unwrap();
        let endpoint = listener.endpoint();
        assert!(matches!(endpoint, Endpoint::Tcp { port, .. } if port != 0));
        assert!(connect(&endpoint).is_ok());
    }

    #[test]
    fn retry_gives_up_with_connect_error() {
        let endpoint = Endpoint::ipc("/tmp/scopewire-definitely-missing.sock");
        let result = connect_with_retry(&endpoint, 2);
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
