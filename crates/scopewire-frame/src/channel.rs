//! Channel IDs used by the messaging patterns.

/// Handshake and subscription control.
pub const CONTROL: u16 = 0;

/// RPC call envelopes, client to server.
pub const REQUEST: u16 = 1;

/// RPC reply envelopes, server to client.
pub const REPLY: u16 = 2;

/// Topic/body pairs from a publisher.
pub const PUBLISH: u16 = 3;

/// Fire-and-forget push/pull signals.
pub const SIGNAL: u16 = 4;

/// Returns a human-readable name for a channel ID.
pub fn channel_name(id: u16) -> &'static str {
    match id {
        CONTROL => "CONTROL",
        REQUEST => "REQUEST",
        REPLY => "REPLY",
        PUBLISH => "PUBLISH",
        SIGNAL => "SIGNAL",
        _ => "UNKNOWN",
    }
}
