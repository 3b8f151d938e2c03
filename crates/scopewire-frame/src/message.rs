use bytes::Bytes;

/// Upper bound on parts per message.
pub const MAX_PARTS: usize = 16;

/// A complete multi-part message on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The channel every part arrived on.
    pub channel: u16,
    /// Message parts in order.
    pub parts: Vec<Bytes>,
}

impl Message {
    /// Build a message from parts.
    pub fn new(channel: u16, parts: Vec<Bytes>) -> Self {
        Self { channel, parts }
    }

    /// Single-part message.
    pub fn single(channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            parts: vec![payload.into()],
        }
    }

    /// Part `index`, if present.
    pub fn part(&self, index: usize) -> Option<&Bytes> {
        self.parts.get(index)
    }

    /// Part `index` as UTF-8 text, if present and valid.
    pub fn part_str(&self, index: usize) -> Option<&str> {
        self.parts
            .get(index)
            .and_then(|part| std::str::from_utf8(part).ok())
    }

    /// Number of parts.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// True if there are no parts.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Total payload bytes across parts.
    pub fn payload_size(&self) -> usize {
        self.parts.iter().map(Bytes::len).sum()
    }
}
