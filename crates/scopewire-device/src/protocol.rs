//! Reply-matching rules for a device family.

use crate::error::{DeviceError, Result};

/// An instruction ready for the wire and the key its reply will carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    /// The device answered with a non-zero error code.
    DeviceError(String),
    /// Keyable but otherwise unreadable.
    Malformed(String),
}

/// A reply with its key recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub key: String,
    pub text: String,
    /// Status events the device sends without being asked.
    pub unsolicited: bool,
    pub status: ReplyStatus,
}

/// How instructions and replies are keyed for one device family.
///
/// `decode` returns an error only when no key can be recovered at all.
pub trait Protocol: Send + Sync {
    fn encode(&self, instruction: &str) -> Result<Encoded>;
    fn decode(&self, raw: &[u8]) -> Result<Decoded>;
    fn terminator(&self) -> &[u8];
}

/// Devices that answer each line with the same line. The whole text is
/// the key.
#[derive(Debug, Clone, Default)]
pub struct EchoProtocol;

impl Protocol for EchoProtocol {
    fn encode(&self, instruction: &str) -> Result<Encoded> {
        if instruction.contains('\n') {
            return Err(DeviceError::Encode("instruction contains a newline".into()));
        }
        let mut bytes = instruction.as_bytes().to_vec();
        bytes.push(b'\n');
        Ok(Encoded {
            bytes,
            key: instruction.to_string(),
        })
    }

    fn decode(&self, raw: &[u8]) -> Result<Decoded> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| DeviceError::Malformed("reply is not utf-8".into()))?
            .trim_end_matches('\r')
            .to_string();
        Ok(Decoded {
            key: text.clone(),
            text,
            unsolicited: false,
            status: ReplyStatus::Ok,
        })
    }

    fn terminator(&self) -> &[u8] {
        b"\n"
    }
}

/// Stand controllers with a five-character numeric header.
///
/// An instruction starts with `DDxCC` where `DD` selects the device and
/// `CC` the command. The reply repeats the header with an error code in
/// the middle position, so the key is the header minus that character.
/// Replies starting with `$` are status events keyed by their first six
/// characters.
#[derive(Debug, Clone, Default)]
pub struct HeaderProtocol;

const HEADER_LEN: usize = 5;

fn header_key(header: &str) -> Option<String> {
    if header.len() < HEADER_LEN || !header.is_ascii() {
        return None;
    }
    Some(format!("{}{}", &header[..2], &header[3..HEADER_LEN]))
}

impl Protocol for HeaderProtocol {
    fn encode(&self, instruction: &str) -> Result<Encoded> {
        let instruction = instruction.trim_end_matches('\r');
        let header = instruction.split(' ').next().unwrap_or_default();
        let key = header_key(header)
            .ok_or_else(|| DeviceError::Encode(format!("bad header in '{instruction}'")))?;
        let mut bytes = instruction.as_bytes().to_vec();
        bytes.push(b'\r');
        Ok(Encoded { bytes, key })
    }

    fn decode(&self, raw: &[u8]) -> Result<Decoded> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| DeviceError::Malformed("reply is not utf-8".into()))?
            .trim_start_matches('\n')
            .to_string();

        if text.starts_with('$') {
            let key = text
                .get(..HEADER_LEN + 1)
                .ok_or_else(|| DeviceError::Malformed(format!("short status event '{text}'")))?
                .to_string();
            return Ok(Decoded {
                key,
                text,
                unsolicited: true,
                status: ReplyStatus::Ok,
            });
        }

        let header = text.split(' ').next().unwrap_or_default();
        let key = header_key(header)
            .ok_or_else(|| DeviceError::Malformed(format!("short header in '{text}'")))?;
        let code = header[2..3].to_string();
        let status = if !header[..HEADER_LEN].bytes().all(|b| b.is_ascii_digit()) {
            ReplyStatus::Malformed(format!("non-numeric header '{header}'"))
        } else if code == "0" {
            ReplyStatus::Ok
        } else {
            ReplyStatus::DeviceError(code)
        };
        Ok(Decoded {
            key,
            text,
            unsolicited: false,
            status,
        })
    }

    fn terminator(&self) -> &[u8] {
        b"\r"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_key_skips_error_code() {
        let protocol = HeaderProtocol;
        let sent = protocol.encode("71023 1000").unwrap();
        assert_eq!(sent.key, "7123");
        assert_eq!(sent.bytes, b"71023 1000\r");

        let ok = protocol.decode(b"71023 1000").unwrap();
        assert_eq!(ok.key, "7123");
        assert_eq!(ok.status, ReplyStatus::Ok);

        let failed = protocol.decode(b"71423").unwrap();
        assert_eq!(failed.key, "7123");
        assert_eq!(failed.status, ReplyStatus::DeviceError("4".into()));
    }

    #[test]
    fn dollar_replies_are_status_events() {
        let event = HeaderProtocol.decode(b"$71004 1").unwrap();
        assert!(event.unsolicited);
        assert_eq!(event.key, "$71004");
    }

    #[test]
    fn short_replies_cannot_be_keyed() {
        assert!(matches!(
            HeaderProtocol.decode(b"71"),
            Err(DeviceError::Malformed(_))
        ));
        assert!(HeaderProtocol.encode("7").is_err());
    }

    #[test]
    fn keyable_garbage_is_malformed() {
        let decoded = HeaderProtocol.decode(b"7x0ab").unwrap();
        assert_eq!(decoded.key, "7xab");
        assert!(matches!(decoded.status, ReplyStatus::Malformed(_)));
    }

    #[test]
    fn echo_key_is_whole_line() {
        let sent = EchoProtocol.encode("hello there").unwrap();
        assert_eq!(sent.key, "hello there");
        assert_eq!(EchoProtocol.decode(b"hello there").unwrap().key, "hello there");
    }
}
