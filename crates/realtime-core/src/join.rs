//! Join payload construction.

use serde::{Deserialize, Serialize};

use crate::filter::PostgresFilter;
use realtime_protocol::JsonObject;

/// Replay window for broadcast history on private channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayOption {
    /// Replay messages sent after this unix timestamp in milliseconds.
    pub since: i64,
    /// Maximum number of replayed messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Broadcast settings of a join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastJoinConfig {
    /// Ask the server to acknowledge each broadcast.
    pub ack: bool,
    /// Receive this client's own broadcasts.
    #[serde(rename = "self")]
    pub self_broadcast: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplayOption>,
}

/// Presence settings of a join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceJoinConfig {
    /// Key this client is tracked under. Empty lets the server pick one.
    pub key: String,
    /// Whether presence events should be delivered.
    pub enabled: bool,
}

/// The `config` member of a join payload. Built fresh for every attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinConfig {
    pub broadcast: BroadcastJoinConfig,
    pub presence: PresenceJoinConfig,
    #[serde(rename = "postgres_changes")]
    pub postgres_changes: Vec<PostgresFilter>,
    #[serde(rename = "private")]
    pub is_private: bool,
}

/// Payload of a `phx_join` push.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinPayload {
    pub config: JoinConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl JoinPayload {
    /// Serialize into a message payload.
    #[must_use]
    pub fn to_object(&self) -> JsonObject {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => JsonObject::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::PostgresEvent;
    use serde_json::json;

    #[test]
    fn test_join_payload_shape() {
        let payload = JoinPayload {
            config: JoinConfig {
                broadcast: BroadcastJoinConfig {
                    ack: true,
                    self_broadcast: false,
                    replay: None,
                },
                presence: PresenceJoinConfig {
                    key: "user-1".into(),
                    enabled: true,
                },
                postgres_changes: vec![
                    PostgresFilter::new(PostgresEvent::Insert, "public").table("messages")
                ],
                is_private: false,
            },
            access_token: Some("token".into()),
            version: None,
        };

        assert_eq!(
            serde_json::Value::Object(payload.to_object()),
            json!({
                "config": {
                    "broadcast": {"ack": true, "self": false},
                    "presence": {"key": "user-1", "enabled": true},
                    "postgres_changes": [
                        {"event": "INSERT", "schema": "public", "table": "messages"}
                    ],
                    "private": false
                },
                "access_token": "token"
            })
        );
    }

    #[test]
    fn test_replay_serialized_when_set() {
        let config = BroadcastJoinConfig {
            ack: false,
            self_broadcast: true,
            replay: Some(ReplayOption {
                since: 1_700_000_000_000,
                limit: Some(25),
            }),
        };

        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({"ack": false, "self": true, "replay": {"since": 1_700_000_000_000i64, "limit": 25}})
        );
    }
}
