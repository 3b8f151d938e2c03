use bytes::Bytes;
use scopewire_frame::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Fault, RpcError};

pub const TAG_ERROR: &str = "error";
pub const TAG_VALUE: &str = "value";
pub const TAG_BINARY: &str = "binary";

/// One call, as sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// Dotted command path, e.g. `stage.move`.
    pub path: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Client-chosen id used to address interrupts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl CallEnvelope {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            call_id: None,
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }
}

/// Exactly one of these answers every call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Error(Fault),
    Value(Value),
    Binary(Bytes),
}

impl Reply {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Error(_) => TAG_ERROR,
            Self::Value(_) => TAG_VALUE,
            Self::Binary(_) => TAG_BINARY,
        }
    }

    /// Body bytes for the second message part.
    pub fn body(&self) -> Bytes {
        match self {
            Self::Error(fault) => encode_json(fault),
            Self::Value(value) => encode_json(value),
            Self::Binary(bytes) => bytes.clone(),
        }
    }

    /// Parse a `[tag, body]` reply message.
    pub fn from_message(message: &Message) -> Result<Self, RpcError> {
        if message.len() != 2 {
            return Err(RpcError::Protocol(format!(
                "expected 2 reply parts, got {}",
                message.len()
            )));
        }
        let body = &message.parts[1];
        match message.part_str(0) {
            Some(TAG_ERROR) => Ok(Self::Error(serde_json::from_slice(body)?)),
            Some(TAG_VALUE) => Ok(Self::Value(serde_json::from_slice(body)?)),
            Some(TAG_BINARY) => Ok(Self::Binary(body.clone())),
            Some(other) => Err(RpcError::Protocol(format!("unknown reply tag '{other}'"))),
            None => Err(RpcError::Protocol("reply tag is not UTF-8".to_string())),
        }
    }

    /// Convert error replies into `Err`.
    pub fn into_result(self) -> Result<Self, Fault> {
        match self {
            Self::Error(fault) => Err(fault),
            other => Ok(other),
        }
    }
}

fn encode_json<T: Serialize>(value: &T) -> Bytes {
    // Value and Fault always serialize.
    serde_json::to_vec(value).map(Bytes::from).unwrap_or_default()
}

/// Message sent on the interrupt channel. `call_id: null` aborts whatever is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptRequest {
    pub call_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopewire_frame::REPLY;
    use serde_json::json;

    fn message(tag: &str, body: &[u8]) -> Message {
        Message::new(
            REPLY,
            vec![Bytes::copy_from_slice(tag.as_bytes()), Bytes::copy_from_slice(body)],
        )
    }

    #[test]
    fn envelope_defaults_missing_arguments() {
        let call: CallEnvelope = serde_json::from_str(r#"{"path":"_ping"}"#).unwrap();
        assert_eq!(call, CallEnvelope::new("_ping"));
    }

    #[test]
    fn envelope_omits_absent_call_id() {
        let call = CallEnvelope::new("stage.move").kwarg("x", 10);
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json, json!({"path": "stage.move", "args": [], "kwargs": {"x": 10}}));
    }

    #[test]
    fn parses_each_reply_kind() {
        let value = Reply::from_message(&message("value", b"[1,2]")).unwrap();
        assert_eq!(value, Reply::Value(json!([1, 2])));

        let binary = Reply::from_message(&message("binary", &[0, 159, 255])).unwrap();
        assert_eq!(binary, Reply::Binary(Bytes::from_static(&[0, 159, 255])));

        let error = Reply::from_message(&message(
            "error",
            br#"{"kind":"NotFound","message":"gone"}"#,
        ))
        .unwrap();
        assert_eq!(error.tag(), TAG_ERROR);
        assert!(error.into_result().is_err());
    }

    #[test]
    fn rejects_unknown_tag_and_part_count() {
        assert!(matches!(
            Reply::from_message(&message("pickle", b"x")),
            Err(RpcError::Protocol(_))
        ));
        let single = Message::single(REPLY, Bytes::from_static(b"value"));
        assert!(matches!(Reply::from_message(&single), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn interrupt_request_keeps_explicit_null() {
        let abort_current = serde_json::to_string(&InterruptRequest { call_id: None }).unwrap();
        assert_eq!(abort_current, r#"{"call_id":null}"#);
    }
}
