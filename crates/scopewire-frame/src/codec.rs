use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: magic (2) + length (4) + channel (2) + flags (1) = 9 bytes.
pub const HEADER_SIZE: usize = 9;

/// Magic bytes: "SW" (0x53 0x57).
pub const MAGIC: [u8; 2] = [0x53, 0x57];

/// Another part of the same message follows this frame.
pub const FLAG_MORE: u8 = 0x01;

/// Default maximum payload size: 64 MiB, enough for a full camera frame.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// One frame: a single part of a message.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The channel this frame belongs to.
    pub channel: u16,
    /// Frame flags.
    pub flags: u8,
    /// The frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a final (single-part) frame.
    pub fn new(channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            flags: 0,
            payload: payload.into(),
        }
    }

    /// Whether another part follows.
    pub fn has_more(&self) -> bool {
        self.flags & FLAG_MORE != 0
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// ```text
/// ┌────────────┬──────────┬──────────┬─────────┬────────────────┐
/// │ Magic (2B) │ Length   │ Channel  │ Flags   │ Payload        │
/// │ "SW"       │ (4B LE)  │ (2B LE)  │ (1B)    │ (Length bytes) │
/// └────────────┴──────────┴──────────┴─────────┴────────────────┘
/// ```
pub fn encode_frame(channel: u16, flags: u8, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(len);
    dst.put_u16_le(channel);
    dst.put_u8(flags);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let payload_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    let channel = u16::from_le_bytes([src[6], src[7]]);
    let flags = src[8];

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    if src.len() < HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        channel,
        flags,
        payload,
    }))
}

/// Configuration for frame readers and writers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size per part in bytes. Default: 64 MiB.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_stable() {
        let mut buf = BytesMut::new();
        encode_frame(0x0102, FLAG_MORE, b"ab", &mut buf).unwrap();
        assert_eq!(
            buf.as_ref(),
            &[0x53, 0x57, 2, 0, 0, 0, 0x02, 0x01, 0x01, b'a', b'b']
        );
    }

    #[test]
    fn decode_preserves_flags() {
        let mut buf = BytesMut::new();
        encode_frame(2, FLAG_MORE, b"value", &mut buf).unwrap();
        encode_frame(2, 0, b"42", &mut buf).unwrap();

        let first = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        let second = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert!(first.has_more());
        assert!(!second.has_more());
        assert_eq!(second.payload.as_ref(), b"42");
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_full_header_and_payload() {
        let mut buf = BytesMut::new();
        encode_frame(1, 0, b"hello", &mut buf).unwrap();
        let mut partial = BytesMut::from(&buf[..HEADER_SIZE - 1]);
        assert!(decode_frame(&mut partial, DEFAULT_MAX_PAYLOAD).unwrap().is_none());

        buf.truncate(HEADER_SIZE + 2);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_SIZE + 2, "incomplete input is not consumed");
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = BytesMut::from(&[0u8; HEADER_SIZE][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::InvalidMagic)));
    }

    #[test]
    fn rejects_oversized_length_before_payload_arrives() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(1024);
        buf.put_u16_le(1);
        buf.put_u8(0);

        let result = decode_frame(&mut buf, 16);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { size: 1024, max: 16 })));
    }

    #[test]
    fn empty_payload_frame() {
        let mut buf = BytesMut::new();
        encode_frame(3, 0, b"", &mut buf).unwrap();
        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(Frame::new(3, Bytes::new()).wire_size(), HEADER_SIZE);
    }
}
