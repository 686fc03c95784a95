//! Decoding of `postgres_changes` events.
//!
//! The server wraps each row change in an envelope listing the ids of every
//! filter it satisfied:
//!
//! ```json
//! {"ids": [1], "data": {"type": "INSERT", "schema": "public", "table": "t",
//!   "commit_timestamp": "...", "columns": [...], "record": {...}}}
//! ```
//!
//! Records are passed through as JSON; column types are not interpreted.

use serde::Deserialize;
use serde_json::Value;

use realtime_protocol::{JsonObject, Message};

/// A column descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Kind of row change carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ChangeType {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    change_type: ChangeType,
    schema: String,
    table: String,
    #[serde(default)]
    commit_timestamp: String,
    #[serde(default)]
    columns: Vec<Column>,
    #[serde(default)]
    record: Option<JsonObject>,
    #[serde(default)]
    old_record: Option<JsonObject>,
    #[serde(default)]
    errors: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChangeEnvelope {
    ids: Vec<i64>,
    data: ChangeData,
}

/// Fields shared by every action.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeMeta {
    pub schema: String,
    pub table: String,
    pub commit_timestamp: String,
    pub columns: Vec<Column>,
    /// The message the change arrived in.
    pub raw: Message,
}

/// A decoded row change, handed to postgres callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum PostgresAction {
    Insert {
        meta: ChangeMeta,
        record: JsonObject,
    },
    Update {
        meta: ChangeMeta,
        record: JsonObject,
        old_record: JsonObject,
    },
    Delete {
        meta: ChangeMeta,
        old_record: JsonObject,
    },
}

impl PostgresAction {
    /// Shared change metadata.
    #[must_use]
    pub fn meta(&self) -> &ChangeMeta {
        match self {
            PostgresAction::Insert { meta, .. }
            | PostgresAction::Update { meta, .. }
            | PostgresAction::Delete { meta, .. } => meta,
        }
    }

    /// Kind of change.
    #[must_use]
    pub fn change_type(&self) -> ChangeType {
        match self {
            PostgresAction::Insert { .. } => ChangeType::Insert,
            PostgresAction::Update { .. } => ChangeType::Update,
            PostgresAction::Delete { .. } => ChangeType::Delete,
        }
    }
}

/// A decoded change together with the filter ids it satisfied.
#[derive(Debug, Clone, PartialEq)]
pub struct PostgresChange {
    pub ids: Vec<i64>,
    pub action: PostgresAction,
}

/// Errors decoding a change envelope.
#[derive(Debug, thiserror::Error)]
pub enum ChangeDecodeError {
    #[error("Invalid change envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("Server reported errors for change: {0}")]
    Server(Value),
}

/// Decode the payload of a `postgres_changes` message.
///
/// # Errors
///
/// Returns an error if the envelope is malformed or carries server errors.
pub fn decode_change(message: &Message) -> Result<PostgresChange, ChangeDecodeError> {
    let envelope: ChangeEnvelope =
        serde_json::from_value(Value::Object(message.payload.clone()))?;
    let data = envelope.data;

    if let Some(errors) = data.errors.filter(|e| !e.is_null()) {
        return Err(ChangeDecodeError::Server(errors));
    }

    let meta = ChangeMeta {
        schema: data.schema,
        table: data.table,
        commit_timestamp: data.commit_timestamp,
        columns: data.columns,
        raw: message.clone(),
    };
    let record = data.record.unwrap_or_default();
    let old_record = data.old_record.unwrap_or_default();

    let action = match data.change_type {
        ChangeType::Insert => PostgresAction::Insert { meta, record },
        ChangeType::Update => PostgresAction::Update {
            meta,
            record,
            old_record,
        },
        ChangeType::Delete => PostgresAction::Delete { meta, old_record },
    };

    Ok(PostgresChange {
        ids: envelope.ids,
        action,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change_message(payload: Value) -> Message {
        Message::new(
            "realtime:public:messages",
            "postgres_changes",
            payload.as_object().cloned().unwrap_or_default(),
        )
    }

    #[test]
    fn test_decode_insert() {
        let message = change_message(json!({
            "ids": [1, 4],
            "data": {
                "type": "INSERT",
                "schema": "public",
                "table": "messages",
                "commit_timestamp": "2024-01-01T00:00:00Z",
                "columns": [{"name": "id", "type": "int8"}],
                "record": {"id": 1, "body": "hi"},
                "errors": null
            }
        }));

        let change = decode_change(&message).unwrap();
        assert_eq!(change.ids, vec![1, 4]);
        match change.action {
            PostgresAction::Insert { meta, record } => {
                assert_eq!(meta.table, "messages");
                assert_eq!(meta.columns[0].type_name, "int8");
                assert_eq!(record["body"], "hi");
            }
            other => panic!("Expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_update_and_delete() {
        let update = change_message(json!({
            "ids": [2],
            "data": {"type": "UPDATE", "schema": "public", "table": "t",
                     "record": {"id": 1, "v": 2}, "old_record": {"id": 1}}
        }));
        let change = decode_change(&update).unwrap();
        assert_eq!(change.action.change_type(), ChangeType::Update);

        let delete = change_message(json!({
            "ids": [3],
            "data": {"type": "DELETE", "schema": "public", "table": "t", "old_record": {"id": 1}}
        }));
        match decode_change(&delete).unwrap().action {
            PostgresAction::Delete { old_record, .. } => assert_eq!(old_record["id"], 1),
            other => panic!("Expected delete, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_errors() {
        let broken = change_message(json!({"ids": "nope"}));
        assert!(matches!(decode_change(&broken), Err(ChangeDecodeError::Envelope(_))));

        let server_error = change_message(json!({
            "ids": [1],
            "data": {"type": "INSERT", "schema": "public", "table": "t", "errors": ["boom"]}
        }));
        assert!(matches!(decode_change(&server_error), Err(ChangeDecodeError::Server(_))));
    }
}
