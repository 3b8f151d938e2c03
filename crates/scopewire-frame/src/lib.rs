//! Length-prefixed multi-part message framing.
//!
//! Every frame on the wire carries:
//! - A 2-byte magic number ("SW") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian channel ID
//! - A 1-byte flag set; [`FLAG_MORE`] marks that another part follows
//!
//! A [`Message`] is one or more frames on the same channel, the last one
//! without `FLAG_MORE`. RPC replies use this to carry a kind tag and a body.

pub mod channel;
pub mod codec;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use channel::{channel_name, CONTROL, PUBLISH, REPLY, REQUEST, SIGNAL};
pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, FLAG_MORE, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use message::{Message, MAX_PARTS};
pub use reader::FrameReader;
pub use writer::FrameWriter;
