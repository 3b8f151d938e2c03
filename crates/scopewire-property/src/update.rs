use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of every property message; the topic is the property name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyUpdate {
    pub name: String,
    pub value: Value,
}

/// Topic carrying heartbeats.
pub const HEARTBEAT_TOPIC: &str = "heartbeat";
