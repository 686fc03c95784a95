//! # realtime-protocol
//!
//! Wire protocol definitions for the realtime channels client.
//!
//! The protocol multiplexes many topics over one socket. Every control
//! message is a JSON array frame; broadcasts may instead use a compact binary
//! frame with length-prefixed fields.
//!
//! ## Frame Types
//!
//! - Text: `[join_ref, ref, topic, event, payload]`
//! - Binary client push (kind 3) and server broadcast (kind 4)
//!
//! ## Example
//!
//! ```rust
//! use realtime_protocol::{codec, Message};
//!
//! let message = Message::heartbeat("1");
//! let text = codec::encode_text(&message).unwrap();
//! let decoded = codec::decode_text(&text).unwrap();
//! assert_eq!(message, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod message;
pub mod version;

pub use codec::{decode_binary, decode_text, encode_broadcast_push, encode_text, ProtocolError};
pub use frames::{
    BroadcastFrame, BroadcastPayload, BroadcastPush, Frame, FrameKind, PayloadEncoding,
};
pub use message::{events, JsonObject, Message, PHOENIX_TOPIC};
pub use version::{Version, PROTOCOL_VERSION};
