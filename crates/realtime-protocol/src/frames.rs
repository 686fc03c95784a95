//! Frame types for the realtime protocol.
//!
//! Control traffic travels as JSON text frames. Broadcasts may also travel as
//! binary frames with single-byte length prefixes, which avoids JSON overhead
//! for high-frequency or binary payloads.

use bytes::Bytes;

use crate::message::{events, JsonObject, Message};

/// Binary frame kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Push = 0,
    Reply = 1,
    Broadcast = 2,
    ClientBroadcastPush = 3,
    ServerBroadcast = 4,
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Push),
            1 => Ok(FrameKind::Reply),
            2 => Ok(FrameKind::Broadcast),
            3 => Ok(FrameKind::ClientBroadcastPush),
            4 => Ok(FrameKind::ServerBroadcast),
            other => Err(other),
        }
    }
}

/// How the payload section of a binary frame is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadEncoding {
    Binary = 0,
    Json = 1,
}

impl TryFrom<u8> for PayloadEncoding {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PayloadEncoding::Binary),
            1 => Ok(PayloadEncoding::Json),
            other => Err(other),
        }
    }
}

/// Payload carried by a binary broadcast frame.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastPayload {
    /// JSON object payload.
    Json(JsonObject),
    /// Opaque bytes.
    Binary(Bytes),
}

impl BroadcastPayload {
    /// The wire encoding of this payload.
    #[must_use]
    pub fn encoding(&self) -> PayloadEncoding {
        match self {
            BroadcastPayload::Json(_) => PayloadEncoding::Json,
            BroadcastPayload::Binary(_) => PayloadEncoding::Binary,
        }
    }
}

/// A client to server broadcast push.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastPush {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    /// Opaque metadata, currently unused by callbacks.
    pub metadata: Bytes,
    pub payload: BroadcastPayload,
}

impl BroadcastPush {
    /// Create a push with no refs and no metadata.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: BroadcastPayload,
    ) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            metadata: Bytes::new(),
            payload,
        }
    }

    /// Set the join and request refs.
    #[must_use]
    pub fn with_refs(mut self, join_ref: Option<String>, msg_ref: Option<String>) -> Self {
        self.join_ref = join_ref;
        self.msg_ref = msg_ref;
        self
    }
}

/// A server to client broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastFrame {
    pub topic: String,
    pub event: String,
    pub metadata: Bytes,
    pub payload: BroadcastPayload,
}

/// An inbound frame, ready for routing.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A JSON message.
    Message(Message),
    /// A binary broadcast with an opaque payload.
    Broadcast(BroadcastFrame),
}

impl Frame {
    /// The topic this frame is addressed to.
    #[must_use]
    pub fn topic(&self) -> &str {
        match self {
            Frame::Message(message) => &message.topic,
            Frame::Broadcast(broadcast) => &broadcast.topic,
        }
    }

    /// The event name of this frame.
    #[must_use]
    pub fn event(&self) -> &str {
        match self {
            Frame::Message(message) => &message.event,
            Frame::Broadcast(_) => events::BROADCAST,
        }
    }
}

impl From<BroadcastFrame> for Frame {
    /// JSON broadcasts become ordinary `broadcast` messages so callers see the
    /// same shape whether the server sent them as text or binary.
    fn from(frame: BroadcastFrame) -> Self {
        match frame.payload {
            BroadcastPayload::Json(payload) => {
                let mut body = JsonObject::new();
                body.insert("type".into(), events::BROADCAST.into());
                body.insert("event".into(), frame.event.into());
                body.insert("payload".into(), payload.into());
                Frame::Message(Message::new(frame.topic, events::BROADCAST, body))
            }
            BroadcastPayload::Binary(_) => Frame::Broadcast(frame),
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Frame::Message(message)
    }
}
