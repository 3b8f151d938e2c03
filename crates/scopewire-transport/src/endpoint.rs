use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::TransportError;

const TCP_SCHEME: &str = "tcp://";
const IPC_SCHEME: &str = "ipc://";

/// Address of a daemon socket.
///
/// Written as `tcp://host:port` or `ipc:///absolute/path.sock`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP host and port. Port `0` asks the OS for a free port on bind.
    Tcp { host: String, port: u16 },
    /// Filesystem path of a Unix domain socket.
    Ipc(PathBuf),
}

impl Endpoint {
    /// TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Unix domain socket endpoint.
    pub fn ipc(path: impl AsRef<Path>) -> Self {
        Self::Ipc(path.as_ref().to_path_buf())
    }

    /// True for Unix domain socket endpoints.
    pub fn is_ipc(&self) -> bool {
        matches!(self, Self::Ipc(_))
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Ipc(_) => "unix-domain-socket",
        }
    }

}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{TCP_SCHEME}{host}:{port}"),
            Self::Ipc(path) => write!(f, "{IPC_SCHEME}{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TransportError::InvalidEndpoint {
            endpoint: s.to_string(),
            reason: reason.to_string(),
        };

        if let Some(rest) = s.strip_prefix(TCP_SCHEME) {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing ':port'"))?;
            if host.is_empty() {
                return Err(invalid("missing host"));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| invalid("port is not a number in 0..=65535"))?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            return Ok(Self::tcp(host, port));
        }

        if let Some(rest) = s.strip_prefix(IPC_SCHEME) {
            if rest.is_empty() {
                return Err(invalid("missing socket path"));
            }
            if !rest.starts_with('/') {
                return Err(invalid("socket path must be absolute"));
            }
            return Ok(Self::ipc(rest));
        }

        Err(invalid("expected tcp:// or ipc:// scheme"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_endpoint() {
        let ep: Endpoint = "tcp://127.0.0.1:6000".parse().unwrap();
        assert_eq!(ep, Endpoint::tcp("127.0.0.1", 6000));
        assert_eq!(ep.to_string(), "tcp://127.0.0.1:6000");
        assert!(!ep.is_ipc());
    }

    #[test]
    fn parses_bracketed_ipv6_host() {
        let ep: Endpoint = "tcp://[::1]:6002".parse().unwrap();
        assert_eq!(ep, Endpoint::tcp("::1", 6002));
    }

    #[test]
    fn parses_ipc_endpoint() {
        let ep: Endpoint = "ipc:///tmp/scope/rpc.sock".parse().unwrap();
        assert_eq!(ep, Endpoint::ipc("/tmp/scope/rpc.sock"));
        assert_eq!(ep.to_string(), "ipc:///tmp/scope/rpc.sock");
        assert!(ep.is_ipc());
    }

    #[test]
    fn rejects_bad_endpoints() {
        for bad in [
            "udp://host:1",
            "tcp://host",
            "tcp://:6000",
            "tcp://host:99999",
            "ipc://",
            "ipc://relative.sock",
        ] {
            let result = bad.parse::<Endpoint>();
            assert!(
                matches!(result, Err(TransportError::InvalidEndpoint { .. })),
                "{bad} should be rejected"
            );
        }
    }
}
