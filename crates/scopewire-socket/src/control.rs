use serde::{Deserialize, Serialize};

/// CONTROL message type: add a topic prefix to a subscription.
pub const CONTROL_SUBSCRIBE: &str = "subscribe";
/// CONTROL message type: remove a topic prefix from a subscription.
pub const CONTROL_UNSUBSCRIBE: &str = "unsubscribe";

/// CONTROL channel message exchanged after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl ControlMessage {
    /// Subscribe to every topic under `prefix`.
    pub fn subscribe(prefix: &str) -> Self {
        Self {
            msg_type: CONTROL_SUBSCRIBE.to_string(),
            prefix: Some(prefix.to_string()),
        }
    }

    /// Drop a previously subscribed prefix.
    pub fn unsubscribe(prefix: &str) -> Self {
        Self {
            msg_type: CONTROL_UNSUBSCRIBE.to_string(),
            prefix: Some(prefix.to_string()),
        }
    }
}
