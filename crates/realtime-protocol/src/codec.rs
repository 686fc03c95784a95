//! Codec for encoding and decoding realtime frames.
//!
//! Text frames are JSON arrays of the form
//! `[join_ref, ref, topic, event, payload]`.
//!
//! Binary frames start with a kind byte followed by single-byte lengths for
//! each variable field. The client push layout is:
//!
//! ```text
//! [kind][joinRefLen][refLen][topicLen][eventLen][metaLen][encoding]
//! [joinRef][ref][topic][event][metadata][payload]
//! ```
//!
//! and the server broadcast layout omits both refs:
//!
//! ```text
//! [kind][topicLen][eventLen][metaLen][encoding][topic][event][metadata][payload]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;

use crate::frames::{
    BroadcastFrame, BroadcastPayload, BroadcastPush, Frame, FrameKind, PayloadEncoding,
};
use crate::message::{JsonObject, Message};

/// Maximum length of a length-prefixed binary field.
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// Header size of a client broadcast push.
pub const PUSH_HEADER_LEN: usize = 7;

/// Header size of a server broadcast.
pub const BROADCAST_HEADER_LEN: usize = 5;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Text frame does not have the expected shape.
    #[error("Invalid frame format: {0}")]
    InvalidFormat(String),

    /// A length-prefixed field exceeds the single-byte length limit.
    #[error("Field {field} is {len} bytes, maximum is {MAX_FIELD_LEN}")]
    FieldTooLong { field: &'static str, len: usize },

    /// Binary frame is shorter than its header declares.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Binary frame has a kind that does not belong to this direction.
    #[error("Unexpected frame kind {found:?}, expected {expected:?}")]
    UnexpectedKind { expected: FrameKind, found: FrameKind },

    /// Binary frame kind is known but not carried by this client.
    #[error("Unsupported frame kind {0:?}")]
    UnsupportedKind(FrameKind),

    /// Unknown binary frame kind byte.
    #[error("Unknown frame kind {0}")]
    UnknownKind(u8),

    /// Unknown payload encoding byte.
    #[error("Unknown payload encoding {0}")]
    UnknownEncoding(u8),

    /// A string field is not valid UTF-8.
    #[error("Field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message as a text frame.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode_text(message: &Message) -> Result<String, ProtocolError> {
    let frame = (
        &message.join_ref,
        &message.msg_ref,
        &message.topic,
        &message.event,
        &message.payload,
    );
    Ok(serde_json::to_string(&frame)?)
}

/// Decode a text frame.
///
/// # Errors
///
/// Returns an error if the text is not JSON or does not have the
/// `[join_ref, ref, topic, event, payload]` shape.
pub fn decode_text(text: &str) -> Result<Message, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Array(mut items) = value else {
        return Err(ProtocolError::InvalidFormat("expected a JSON array".into()));
    };

    if items.len() < 5 {
        return Err(ProtocolError::InvalidFormat(format!(
            "expected 5 elements, got {}",
            items.len()
        )));
    }
    items.truncate(5);

    let mut items = items.into_iter();
    let join_ref = optional_string(items.next(), "join_ref")?;
    let msg_ref = optional_string(items.next(), "ref")?;
    let topic = required_string(items.next(), "topic")?;
    let event = required_string(items.next(), "event")?;
    let payload = match items.next() {
        Some(Value::Object(map)) => map,
        _ => return Err(ProtocolError::InvalidFormat("payload must be an object".into())),
    };

    Ok(Message {
        join_ref,
        msg_ref,
        topic,
        event,
        payload,
    })
}

fn optional_string(value: Option<Value>, field: &str) -> Result<Option<String>, ProtocolError> {
    match value {
        Some(Value::Null) | None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(ProtocolError::InvalidFormat(format!(
            "{field} must be a string or null, got {other}"
        ))),
    }
}

fn required_string(value: Option<Value>, field: &str) -> Result<String, ProtocolError> {
    match value {
        Some(Value::String(s)) => Ok(s),
        _ => Err(ProtocolError::InvalidFormat(format!("{field} must be a string"))),
    }
}

/// Encode a client broadcast push as a binary frame.
///
/// # Errors
///
/// Returns an error if a length-prefixed field exceeds 255 bytes or the JSON
/// payload cannot be serialized.
pub fn encode_broadcast_push(push: &BroadcastPush) -> Result<Bytes, ProtocolError> {
    let join_ref = push.join_ref.as_deref().unwrap_or_default().as_bytes();
    let msg_ref = push.msg_ref.as_deref().unwrap_or_default().as_bytes();
    let topic = push.topic.as_bytes();
    let event = push.event.as_bytes();
    let payload = payload_bytes(&push.payload)?;

    let header = [
        u8::from(FrameKind::ClientBroadcastPush),
        field_len("join_ref", join_ref)?,
        field_len("ref", msg_ref)?,
        field_len("topic", topic)?,
        field_len("event", event)?,
        field_len("metadata", &push.metadata)?,
        push.payload.encoding() as u8,
    ];

    let mut buf = BytesMut::with_capacity(
        PUSH_HEADER_LEN
            + join_ref.len()
            + msg_ref.len()
            + topic.len()
            + event.len()
            + push.metadata.len()
            + payload.len(),
    );
    buf.put_slice(&header);
    buf.put_slice(join_ref);
    buf.put_slice(msg_ref);
    buf.put_slice(topic);
    buf.put_slice(event);
    buf.put_slice(&push.metadata);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

/// Decode a client broadcast push. This is the server side of
/// [`encode_broadcast_push`].
///
/// # Errors
///
/// Returns an error if the kind is wrong or the frame is truncated.
pub fn decode_broadcast_push(data: &[u8]) -> Result<BroadcastPush, ProtocolError> {
    let mut reader = Reader::new(data);
    reader.expect_kind(FrameKind::ClientBroadcastPush)?;
    let header = reader.take(PUSH_HEADER_LEN - 1, "header")?;
    let (join_ref_len, ref_len, topic_len, event_len, meta_len) = (
        header[0] as usize,
        header[1] as usize,
        header[2] as usize,
        header[3] as usize,
        header[4] as usize,
    );
    let encoding = encoding_from(header[5])?;

    let join_ref = reader.take_str(join_ref_len, "join_ref")?;
    let msg_ref = reader.take_str(ref_len, "ref")?;
    let topic = reader.take_str(topic_len, "topic")?;
    let event = reader.take_str(event_len, "event")?;
    let metadata = Bytes::copy_from_slice(reader.take(meta_len, "metadata")?);
    let payload = payload_from(encoding, reader.rest())?;

    Ok(BroadcastPush {
        join_ref: Some(join_ref).filter(|s| !s.is_empty()),
        msg_ref: Some(msg_ref).filter(|s| !s.is_empty()),
        topic,
        event,
        metadata,
        payload,
    })
}

/// Encode a server broadcast. This is the server side of [`decode_broadcast`].
///
/// # Errors
///
/// Returns an error if a length-prefixed field exceeds 255 bytes.
pub fn encode_broadcast(frame: &BroadcastFrame) -> Result<Bytes, ProtocolError> {
    let topic = frame.topic.as_bytes();
    let event = frame.event.as_bytes();
    let payload = payload_bytes(&frame.payload)?;

    let header = [
        u8::from(FrameKind::ServerBroadcast),
        field_len("topic", topic)?,
        field_len("event", event)?,
        field_len("metadata", &frame.metadata)?,
        frame.payload.encoding() as u8,
    ];

    let mut buf = BytesMut::with_capacity(
        BROADCAST_HEADER_LEN + topic.len() + event.len() + frame.metadata.len() + payload.len(),
    );
    buf.put_slice(&header);
    buf.put_slice(topic);
    buf.put_slice(event);
    buf.put_slice(&frame.metadata);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

/// Decode a server broadcast.
///
/// # Errors
///
/// Returns an error if the kind is wrong or the frame is truncated.
pub fn decode_broadcast(data: &[u8]) -> Result<BroadcastFrame, ProtocolError> {
    let mut reader = Reader::new(data);
    reader.expect_kind(FrameKind::ServerBroadcast)?;
    let header = reader.take(BROADCAST_HEADER_LEN - 1, "header")?;
    let (topic_len, event_len, meta_len) =
        (header[0] as usize, header[1] as usize, header[2] as usize);
    let encoding = encoding_from(header[3])?;

    let topic = reader.take_str(topic_len, "topic")?;
    let event = reader.take_str(event_len, "event")?;
    // Metadata is parsed for forward compatibility; nothing reads it yet.
    let metadata = Bytes::copy_from_slice(reader.take(meta_len, "metadata")?);
    let payload = payload_from(encoding, reader.rest())?;

    Ok(BroadcastFrame {
        topic,
        event,
        metadata,
        payload,
    })
}

/// Decode an inbound binary frame into a routable [`Frame`].
///
/// # Errors
///
/// Returns an error for unknown or unsupported kinds and malformed frames.
pub fn decode_binary(data: &[u8]) -> Result<Frame, ProtocolError> {
    let Some(&kind) = data.first() else {
        return Err(ProtocolError::Malformed("empty frame".into()));
    };

    match FrameKind::try_from(kind).map_err(ProtocolError::UnknownKind)? {
        FrameKind::ServerBroadcast => decode_broadcast(data).map(Frame::from),
        FrameKind::ClientBroadcastPush => Err(ProtocolError::UnexpectedKind {
            expected: FrameKind::ServerBroadcast,
            found: FrameKind::ClientBroadcastPush,
        }),
        legacy => Err(ProtocolError::UnsupportedKind(legacy)),
    }
}

fn field_len(field: &'static str, value: &[u8]) -> Result<u8, ProtocolError> {
    u8::try_from(value.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: value.len(),
    })
}

fn payload_bytes(payload: &BroadcastPayload) -> Result<Vec<u8>, ProtocolError> {
    match payload {
        BroadcastPayload::Json(object) => Ok(serde_json::to_vec(object)?),
        BroadcastPayload::Binary(bytes) => Ok(bytes.to_vec()),
    }
}

fn payload_from(encoding: PayloadEncoding, data: &[u8]) -> Result<BroadcastPayload, ProtocolError> {
    match encoding {
        PayloadEncoding::Json => Ok(BroadcastPayload::Json(serde_json::from_slice::<JsonObject>(
            data,
        )?)),
        PayloadEncoding::Binary => Ok(BroadcastPayload::Binary(Bytes::copy_from_slice(data))),
    }
}

fn encoding_from(byte: u8) -> Result<PayloadEncoding, ProtocolError> {
    PayloadEncoding::try_from(byte).map_err(ProtocolError::UnknownEncoding)
}

/// Bounds-checked cursor over a binary frame.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn expect_kind(&mut self, expected: FrameKind) -> Result<(), ProtocolError> {
        let byte = self.take(1, "kind")?[0];
        let found = FrameKind::try_from(byte).map_err(ProtocolError::UnknownKind)?;
        if found != expected {
            return Err(ProtocolError::UnexpectedKind { expected, found });
        }
        Ok(())
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(ProtocolError::Malformed(format!(
                "{field} needs {len} bytes at offset {}, frame is {} bytes",
                self.pos,
                self.data.len()
            )));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_str(&mut self, len: usize, field: &'static str) -> Result<String, ProtocolError> {
        let bytes = self.take(len, field)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8(field))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}
