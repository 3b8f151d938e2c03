use std::io::{Read, Write};
use std::time::{Duration, Instant};

use scopewire_frame::{FrameError, FrameReader, FrameWriter, CONTROL};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SocketError};
use crate::pattern::Pattern;

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_PEER_ID_LEN: usize = 128;
const MAX_NODE_LEN: usize = 255;

/// Client handshake request sent on CONTROL channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Protocol name. `scopewire` by default.
    pub protocol: String,
    /// Protocol version string, `<major>.<minor>`.
    pub version: String,
    /// Pattern of the connecting socket.
    pub pattern: Pattern,
    /// Host name of the connecting process.
    pub node: String,
}

/// Server handshake response sent on CONTROL channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Protocol name. Must match request protocol.
    pub protocol: String,
    /// Server protocol version.
    pub version: String,
    /// Pattern of the accepting socket.
    pub pattern: Pattern,
    /// Server-assigned identifier for this connection.
    pub peer_id: String,
    /// Host name of the server process.
    pub node: String,
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Server-assigned connection identifier.
    pub peer_id: String,
    /// Protocol version of the remote side.
    pub protocol_version: String,
    /// Host name reported by the remote side.
    pub remote_node: String,
    /// Pattern of the remote side.
    pub remote_pattern: Pattern,
}

/// Configuration for handshake negotiation.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Timeout for each blocking handshake operation.
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version.
    pub protocol_version: String,
    /// Maximum handshake frame payload size in bytes.
    pub max_handshake_payload: usize,
    /// Host name announced to the peer.
    pub node: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "scopewire".to_string(),
            protocol_version: "1.0".to_string(),
            max_handshake_payload: 16 * 1024,
            node: scopewire_transport::node_name(),
        }
    }
}

/// Perform the client side of the handshake.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    pattern: Pattern,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_node(&config.node)?;

    let req = HandshakeRequest {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        pattern,
        node: config.node.clone(),
    };
    send_control_json(writer, &req)?;

    let payload = recv_control_payload(reader, config)?;
    let resp: HandshakeResponse = serde_json::from_slice(&payload)?;

    validate_protocol_name(&resp.protocol)?;
    validate_version(&resp.version)?;
    validate_peer_id(&resp.peer_id)?;
    validate_node(&resp.node)?;

    if resp.protocol != config.protocol_name {
        return Err(SocketError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            resp.protocol, config.protocol_name
        )));
    }
    if !is_version_compatible(&config.protocol_version, &resp.version)? {
        return Err(SocketError::HandshakeFailed(format!(
            "incompatible version '{}' (local '{}')",
            resp.version, config.protocol_version
        )));
    }
    if resp.pattern != pattern.counterpart() {
        return Err(SocketError::HandshakeFailed(format!(
            "server pattern '{}' cannot serve '{}'",
            resp.pattern.as_str(),
            pattern.as_str()
        )));
    }

    Ok(HandshakeResult {
        peer_id: resp.peer_id,
        protocol_version: resp.version,
        remote_node: resp.node,
        remote_pattern: resp.pattern,
    })
}

/// Perform the server side of the handshake.
///
/// On rejection nothing is sent back; the caller drops the stream and the
/// client observes a disconnect.
pub fn handshake_server<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    pattern: Pattern,
    peer_id: &str,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_peer_id(peer_id)?;

    let payload = recv_control_payload(reader, config)?;
    let req: HandshakeRequest = serde_json::from_slice(&payload)?;

    validate_protocol_name(&req.protocol)?;
    validate_version(&req.version)?;
    validate_node(&req.node)?;

    if req.protocol != config.protocol_name {
        return Err(SocketError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            req.protocol, config.protocol_name
        )));
    }
    if !is_version_compatible(&req.version, &config.protocol_version)? {
        return Err(SocketError::HandshakeFailed(format!(
            "incompatible version '{}' (server '{}')",
            req.version, config.protocol_version
        )));
    }
    if req.pattern != pattern.counterpart() {
        return Err(SocketError::HandshakeFailed(format!(
            "'{}' client cannot connect to a '{}' socket",
            req.pattern.as_str(),
            pattern.as_str()
        )));
    }

    let resp = HandshakeResponse {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        pattern,
        peer_id: peer_id.to_string(),
        node: config.node.clone(),
    };
    send_control_json(writer, &resp)?;

    Ok(HandshakeResult {
        peer_id: peer_id.to_string(),
        protocol_version: req.version,
        remote_node: req.node,
        remote_pattern: req.pattern,
    })
}

fn send_control_json<T: Serialize, W: Write>(writer: &mut FrameWriter<W>, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    writer.send(CONTROL, &payload)?;
    Ok(())
}

fn recv_control_payload<R: Read>(
    reader: &mut FrameReader<R>,
    config: &HandshakeConfig,
) -> Result<Vec<u8>> {
    let deadline = Instant::now() + config.timeout;
    loop {
        if Instant::now() >= deadline {
            return Err(SocketError::Timeout(config.timeout));
        }

        match reader.read_frame() {
            Ok(frame) => {
                if frame.channel != CONTROL {
                    return Err(SocketError::HandshakeFailed(format!(
                        "expected CONTROL channel {}, got {}",
                        CONTROL, frame.channel
                    )));
                }
                if frame.payload.len() > config.max_handshake_payload {
                    return Err(SocketError::HandshakeFailed(format!(
                        "handshake payload too large: {} (max {})",
                        frame.payload.len(),
                        config.max_handshake_payload
                    )));
                }
                return Ok(frame.payload.to_vec());
            }
            Err(err) if err.is_timeout() => continue,
            Err(FrameError::ConnectionClosed) => {
                return Err(SocketError::Disconnected(
                    "connection closed during handshake".to_string(),
                ));
            }
            Err(err) => return Err(SocketError::Frame(err)),
        }
    }
}

fn check_len(what: &str, value: &str, max: usize) -> Result<()> {
    if value.is_empty() || value.len() > max {
        return Err(SocketError::HandshakeFailed(format!(
            "invalid {what} length: {}",
            value.len()
        )));
    }
    Ok(())
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    check_len("protocol name", protocol, MAX_PROTOCOL_LEN)
}

fn validate_version(version: &str) -> Result<()> {
    check_len("protocol version", version, MAX_VERSION_LEN)?;
    parse_version(version).map(|_| ())
}

fn validate_peer_id(peer_id: &str) -> Result<()> {
    check_len("peer_id", peer_id, MAX_PEER_ID_LEN)
}

fn validate_node(node: &str) -> Result<()> {
    check_len("node name", node, MAX_NODE_LEN)
}

fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, client_minor) = parse_version(client_version)?;
    let (server_major, server_minor) = parse_version(server_version)?;
    Ok(client_major == server_major && client_minor >= server_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let bad = |why: &str| SocketError::HandshakeFailed(format!("invalid version '{version}': {why}"));
    let (major, minor) = version
        .split_once('.')
        .ok_or_else(|| bad("expected '<major>.<minor>'"))?;
    let major = major.parse::<u16>().map_err(|_| bad("non-numeric major"))?;
    let minor = minor.parse::<u16>().map_err(|_| bad("non-numeric minor"))?;
    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, ErrorKind, Read};
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;

    fn pair_handshake(
        server_pattern: Pattern,
        client_pattern: Pattern,
        server_cfg: HandshakeConfig,
        client_cfg: HandshakeConfig,
    ) -> (Result<HandshakeResult>, Result<HandshakeResult>) {
        let (left, right) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || {
            let mut reader = FrameReader::new(left.try_clone().unwrap());
            let mut writer = FrameWriter::new(left);
            handshake_server(&mut reader, &mut writer, server_pattern, "peer-1", &server_cfg)
        });

        let mut reader = FrameReader::new(right.try_clone().unwrap());
        let mut writer = FrameWriter::new(right);
        let client = handshake_client(&mut reader, &mut writer, client_pattern, &client_cfg);
        drop(reader);
        drop(writer);
        (server.join().unwrap(), client)
    }

    fn with_node(node: &str) -> HandshakeConfig {
        HandshakeConfig {
            node: node.to_string(),
            ..HandshakeConfig::default()
        }
    }

    #[test]
    fn matching_patterns_exchange_nodes() {
        let (server, client) = pair_handshake(
            Pattern::Reply,
            Pattern::Request,
            with_node("scope-host"),
            with_node("gui-host"),
        );
        let server = server.unwrap();
        let client = client.unwrap();

        assert_eq!(client.peer_id, "peer-1");
        assert_eq!(client.remote_node, "scope-host");
        assert_eq!(client.remote_pattern, Pattern::Reply);
        assert_eq!(server.remote_node, "gui-host");
        assert_eq!(server.remote_pattern, Pattern::Request);
    }

    #[test]
    fn mismatched_pattern_is_rejected() {
        let (server, client) = pair_handshake(
            Pattern::Publish,
            Pattern::Request,
            HandshakeConfig::default(),
            HandshakeConfig::default(),
        );
        assert!(matches!(server, Err(SocketError::HandshakeFailed(_))));
        assert!(matches!(client, Err(SocketError::Disconnected(_))));
    }

    #[test]
    fn wrong_protocol_is_rejected() {
        let client_cfg = HandshakeConfig {
            protocol_name: "ipc".to_string(),
            ..HandshakeConfig::default()
        };
        let (server, client) = pair_handshake(
            Pattern::Pull,
            Pattern::Push,
            HandshakeConfig::default(),
            client_cfg,
        );
        assert!(matches!(server, Err(SocketError::HandshakeFailed(_))));
        assert!(client.is_err());
    }

    #[test]
    fn newer_server_minor_is_incompatible() {
        let server_cfg = HandshakeConfig {
            protocol_version: "1.2".to_string(),
            ..HandshakeConfig::default()
        };
        let (server, _client) = pair_handshake(
            Pattern::Reply,
            Pattern::Request,
            server_cfg,
            HandshakeConfig::default(),
        );
        assert!(matches!(server, Err(SocketError::HandshakeFailed(_))));
    }

    #[test]
    fn garbage_request_is_json_error() {
        let (left, right) = UnixStream::pair().unwrap();
        FrameWriter::new(left).send(CONTROL, b"{nope").unwrap();

        let mut reader = FrameReader::new(right.try_clone().unwrap());
        let mut writer = FrameWriter::new(right);
        let result = handshake_server(
            &mut reader,
            &mut writer,
            Pattern::Reply,
            "peer-9",
            &HandshakeConfig::default(),
        );
        assert!(matches!(result, Err(SocketError::Json(_))));
    }

    #[test]
    fn silent_peer_times_out() {
        let mut reader = FrameReader::new(AlwaysTimedOut);
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let cfg = HandshakeConfig {
            timeout: Duration::from_millis(20),
            ..HandshakeConfig::default()
        };
        let result = handshake_client(&mut reader, &mut writer, Pattern::Subscribe, &cfg);
        assert!(matches!(result, Err(SocketError::Timeout(_))));
    }

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version("1.0").unwrap(), (1, 0));
        assert!(parse_version("1").is_err());
        assert!(parse_version("1.x").is_err());
        assert!(parse_version("1.0.3").is_err());
        assert!(is_version_compatible("1.3", "1.1").unwrap());
        assert!(!is_version_compatible("2.0", "1.0").unwrap());
    }

    struct AlwaysTimedOut;

    impl Read for AlwaysTimedOut {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::TimedOut))
        }
    }
}
