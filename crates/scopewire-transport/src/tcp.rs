use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};

use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::IpcStream;

/// TCP listener for clients on other hosts.
pub struct TcpSocket {
    listener: TcpListener,
    host: String,
    port: u16,
}

impl TcpSocket {
    /// Bind and listen on `host:port`. Port `0` picks a free port.
    pub fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).map_err(|source| TransportError::Bind {
            endpoint: format!("tcp://{host}:{port}"),
            source,
        })?;
        let port = listener.local_addr()?.port();
        info!(host, port, "listening on tcp");
        Ok(Self {
            listener,
            host: host.to_string(),
            port,
        })
    }

    /// Accept an incoming connection.
    pub fn accept(&self) -> Result<IpcStream> {
        let (stream, addr) = self.listener.accept().map_err(TransportError::Accept)?;
        stream.set_nonblocking(false)?;
        debug!(%addr, "accepted tcp connection");
        Ok(IpcStream::from_tcp(stream))
    }

    /// Accept a waiting connection, or return `None` if nobody is queued.
    pub fn try_accept(&self) -> Result<Option<IpcStream>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false)?;
                debug!(%addr, "accepted tcp connection");
                Ok(Some(IpcStream::from_tcp(stream)))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(None),
            Err(err) => Err(TransportError::Accept(err)),
        }
    }

    /// Switch the listening socket between blocking and non-blocking accept.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Connect to `host:port`.
    pub fn connect(host: &str, port: u16) -> Result<IpcStream> {
        let stream =
            TcpStream::connect((host, port)).map_err(|source| TransportError::Connect {
                endpoint: format!("tcp://{host}:{port}"),
                source,
            })?;
        debug!(host, port, "connected over tcp");
        Ok(IpcStream::from_tcp(stream))
    }

    /// The bound endpoint, with the actual port if `0` was requested.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::tcp(self.host.clone(), self.port)
    }
}

#[cfg(unix)]
impl std::os::fd::AsRawFd for TcpSocket {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        std::os::fd::AsRawFd::as_raw_fd(&self.listener)
    }
}
