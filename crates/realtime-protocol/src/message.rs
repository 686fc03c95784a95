//! Protocol messages and well-known event names.

use serde_json::Value;

/// A JSON object payload.
pub type JsonObject = serde_json::Map<String, Value>;

/// Topic used for socket-level messages such as heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Event names used on the wire.
pub mod events {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const ERROR: &str = "phx_error";
    pub const CLOSE: &str = "phx_close";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const SYSTEM: &str = "system";
    pub const BROADCAST: &str = "broadcast";
    pub const PRESENCE: &str = "presence";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PRESENCE_DIFF: &str = "presence_diff";
    pub const POSTGRES_CHANGES: &str = "postgres_changes";
}

/// A protocol message.
///
/// `msg_ref` correlates a request with its reply. `join_ref` scopes a message
/// to one join attempt so replies belonging to a superseded join can be told
/// apart from current ones.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Ref of the join this message belongs to.
    pub join_ref: Option<String>,
    /// Request ref.
    pub msg_ref: Option<String>,
    /// Target topic.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Message payload.
    pub payload: JsonObject,
}

impl Message {
    /// Create a message without refs.
    #[must_use]
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: JsonObject) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Set the join ref.
    #[must_use]
    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    /// Set the request ref.
    #[must_use]
    pub fn with_ref(mut self, msg_ref: impl Into<String>) -> Self {
        self.msg_ref = Some(msg_ref.into());
        self
    }

    /// Build a heartbeat message.
    #[must_use]
    pub fn heartbeat(msg_ref: impl Into<String>) -> Self {
        Self::new(PHOENIX_TOPIC, events::HEARTBEAT, JsonObject::new()).with_ref(msg_ref)
    }

    /// Reply status (`payload.status`), if this is a reply.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }

    /// Reply body (`payload.response`) as an object.
    #[must_use]
    pub fn response(&self) -> Option<&JsonObject> {
        self.payload.get("response").and_then(Value::as_object)
    }

    /// Check whether this message is a reply to the given ref.
    #[must_use]
    pub fn is_reply_to(&self, msg_ref: &str) -> bool {
        self.event == events::REPLY && self.msg_ref.as_deref() == Some(msg_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_builders() {
        let msg = Message::new("realtime:room", events::JOIN, JsonObject::new())
            .with_join_ref("1")
            .with_ref("2");

        assert_eq!(msg.join_ref.as_deref(), Some("1"));
        assert_eq!(msg.msg_ref.as_deref(), Some("2"));
        assert_eq!(msg.topic, "realtime:room");
    }

    #[test]
    fn test_reply_accessors() {
        let payload = json!({"status": "ok", "response": {"postgres_changes": []}});
        let msg = Message::new("t", events::REPLY, payload.as_object().cloned().unwrap_or_default())
            .with_ref("7");

        assert_eq!(msg.status(), Some("ok"));
        assert!(msg.response().is_some());
        assert!(msg.is_reply_to("7"));
        assert!(!msg.is_reply_to("8"));
    }

    #[test]
    fn test_heartbeat() {
        let msg = Message::heartbeat("42");
        assert_eq!(msg.topic, PHOENIX_TOPIC);
        assert_eq!(msg.event, events::HEARTBEAT);
        assert!(msg.payload.is_empty());
    }
}
