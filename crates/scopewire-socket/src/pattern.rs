use serde::{Deserialize, Serialize};

/// Role a socket plays on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    Request,
    Reply,
    Publish,
    Subscribe,
    Push,
    Pull,
}

impl Pattern {
    /// The pattern the other end of a connection must use.
    pub fn counterpart(self) -> Pattern {
        match self {
            Pattern::Request => Pattern::Reply,
            Pattern::Reply => Pattern::Request,
            Pattern::Publish => Pattern::Subscribe,
            Pattern::Subscribe => Pattern::Publish,
            Pattern::Push => Pattern::Pull,
            Pattern::Pull => Pattern::Push,
        }
    }

    /// Lower-case name as used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Pattern::Request => "request",
            Pattern::Reply => "reply",
            Pattern::Publish => "publish",
            Pattern::Subscribe => "subscribe",
            Pattern::Push => "push",
            Pattern::Pull => "pull",
        }
    }
}
