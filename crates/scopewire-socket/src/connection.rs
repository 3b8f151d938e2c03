use std::time::Duration;

use scopewire_frame::{FrameConfig, FrameError, FrameReader, FrameWriter, Message, DEFAULT_MAX_PAYLOAD};
use scopewire_transport::{Endpoint, IpcStream};
use tracing::debug;

use crate::error::{Result, SocketError};
use crate::handshake::{handshake_client, handshake_server, HandshakeConfig, HandshakeResult};
use crate::pattern::Pattern;

/// What one end knows about the other after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Server-assigned connection id (`peer-N`).
    pub peer_id: String,
    /// Host name the remote side reported.
    pub node: String,
    /// Both ends share a host: unix socket, loopback TCP, or equal host names.
    pub local: bool,
    /// Transport name for diagnostics.
    pub transport: &'static str,
}

impl PeerInfo {
    fn from_handshake(stream: &IpcStream, handshake: &HandshakeResult, local_node: &str) -> Self {
        Self {
            peer_id: handshake.peer_id.clone(),
            node: handshake.remote_node.clone(),
            local: stream.is_loopback() || handshake.remote_node == local_node,
            transport: stream.transport_name(),
        }
    }
}

/// Settings shared by every socket type.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Handshake negotiation.
    pub handshake: HandshakeConfig,
    /// Frame limits and write timeout after the handshake.
    pub frame: FrameConfig,
    /// How often background threads wake to check for shutdown.
    pub poll_interval: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            frame: FrameConfig {
                max_payload_size: DEFAULT_MAX_PAYLOAD,
                read_timeout: None,
                write_timeout: Some(Duration::from_secs(5)),
            },
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// A connection that completed its handshake.
pub struct Connection {
    info: PeerInfo,
    reader: FrameReader<IpcStream>,
    writer: FrameWriter<IpcStream>,
}

impl Connection {
    /// Connect to `endpoint` and handshake as `pattern`.
    pub fn connect(endpoint: &Endpoint, pattern: Pattern, config: &SocketConfig) -> Result<Self> {
        let stream = scopewire_transport::connect(endpoint)?;
        let (mut reader, mut writer) = handshake_streams(stream, &config.handshake)?;
        let handshake = handshake_client(&mut reader, &mut writer, pattern, &config.handshake)?;
        debug!(%endpoint, peer_id = %handshake.peer_id, pattern = pattern.as_str(), "connected");
        Self::finish(reader, writer, handshake, config)
    }

    /// Handshake an accepted stream as `pattern`, naming the peer `peer_id`.
    pub fn accept(
        stream: IpcStream,
        pattern: Pattern,
        peer_id: &str,
        config: &SocketConfig,
    ) -> Result<Self> {
        let (mut reader, mut writer) = handshake_streams(stream, &config.handshake)?;
        let handshake =
            handshake_server(&mut reader, &mut writer, pattern, peer_id, &config.handshake)?;
        Self::finish(reader, writer, handshake, config)
    }

    fn finish(
        mut reader: FrameReader<IpcStream>,
        mut writer: FrameWriter<IpcStream>,
        handshake: HandshakeResult,
        config: &SocketConfig,
    ) -> Result<Self> {
        // The handshake runs with a tight payload budget; lift it afterwards.
        reader.set_max_payload_size(config.frame.max_payload_size);
        writer.set_max_payload_size(config.frame.max_payload_size);
        reader.set_read_timeout(config.frame.read_timeout)?;
        writer
            .get_ref()
            .set_write_timeout(config.frame.write_timeout)?;

        let info = PeerInfo::from_handshake(reader.get_ref(), &handshake, &config.handshake.node);
        Ok(Self {
            info,
            reader,
            writer,
        })
    }

    /// Information about the remote end.
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// Send a multi-part message.
    pub fn send(&mut self, channel: u16, parts: &[&[u8]]) -> Result<()> {
        self.writer.send_message(channel, parts)?;
        Ok(())
    }

    /// Receive the next message (blocking).
    pub fn recv(&mut self) -> Result<Message> {
        self.reader.set_read_timeout(None)?;
        self.read()
    }

    /// Receive the next message, or `None` if `timeout` passes first.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        self.reader
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match self.read() {
            Ok(message) => Ok(Some(message)),
            Err(SocketError::Frame(err)) if err.is_timeout() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn read(&mut self) -> Result<Message> {
        match self.reader.read_message() {
            Ok(message) => Ok(message),
            Err(FrameError::ConnectionClosed) => {
                Err(SocketError::Disconnected(self.info.peer_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Close both directions; a peer blocked on read sees EOF.
    pub fn shutdown(&self) -> Result<()> {
        self.writer.get_ref().shutdown()?;
        Ok(())
    }

    /// Split into peer info, reader and writer.
    pub fn into_parts(self) -> (PeerInfo, FrameReader<IpcStream>, FrameWriter<IpcStream>) {
        (self.info, self.reader, self.writer)
    }
}

fn handshake_streams(
    stream: IpcStream,
    config: &HandshakeConfig,
) -> Result<(FrameReader<IpcStream>, FrameWriter<IpcStream>)> {
    let frame_config = FrameConfig {
        max_payload_size: config.max_handshake_payload,
        read_timeout: Some(config.timeout),
        write_timeout: Some(config.timeout),
    };
    let reader_stream = stream.try_clone()?;
    let reader = FrameReader::with_config_ipc(reader_stream, frame_config.clone())?;
    let writer = FrameWriter::with_config_ipc(stream, frame_config)?;
    Ok((reader, writer))
}
