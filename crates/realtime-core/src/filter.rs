//! Postgres change filters.
//!
//! A client declares filters before joining. The join reply echoes them back
//! with server-assigned ids, which later change events reference.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// The kind of row change a filter listens for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum PostgresEvent {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    All,
}

impl PostgresEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PostgresEvent::Insert => "INSERT",
            PostgresEvent::Update => "UPDATE",
            PostgresEvent::Delete => "DELETE",
            PostgresEvent::All => "*",
        }
    }

    /// Check whether this event covers `other`, treating `All` as a wildcard
    /// on either side.
    #[must_use]
    pub fn matches(&self, other: &PostgresEvent) -> bool {
        matches!(
            (self, other),
            (PostgresEvent::All, _)
                | (_, PostgresEvent::All)
                | (PostgresEvent::Insert, PostgresEvent::Insert)
                | (PostgresEvent::Update, PostgresEvent::Update)
                | (PostgresEvent::Delete, PostgresEvent::Delete)
        )
    }
}

impl PartialEq for PostgresEvent {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

impl std::fmt::Display for PostgresEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A postgres change subscription filter.
///
/// Equality ignores `server_id` and treats [`PostgresEvent::All`] as equal to
/// any concrete event, so a client wildcard filter matches the per-event
/// filters the server reports after join. Note that this equality is not
/// transitive across concrete events. Hashing covers schema, table and filter
/// only, which keeps it consistent with that equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresFilter {
    pub event: PostgresEvent,
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Server-assigned id, read from join replies and never sent.
    #[serde(rename = "id", default, skip_serializing)]
    pub server_id: i64,
}

impl PostgresFilter {
    /// Create a filter on a schema.
    #[must_use]
    pub fn new(event: PostgresEvent, schema: impl Into<String>) -> Self {
        Self {
            event,
            schema: schema.into(),
            table: None,
            filter: None,
            server_id: 0,
        }
    }

    /// Restrict the filter to a table.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Add a row filter such as `id=eq.1`.
    #[must_use]
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set the server-assigned id.
    #[must_use]
    pub fn with_server_id(mut self, server_id: i64) -> Self {
        self.server_id = server_id;
        self
    }
}

impl PartialEq for PostgresFilter {
    fn eq(&self, other: &Self) -> bool {
        self.event.matches(&other.event)
            && self.schema == other.schema
            && self.table == other.table
            && self.filter == other.filter
    }
}

impl Hash for PostgresFilter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.schema.hash(state);
        self.table.hash(state);
        self.filter.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(filter: &PostgresFilter) -> u64 {
        let mut hasher = DefaultHasher::new();
        filter.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_wildcard_matches_concrete_event() {
        let client = PostgresFilter::new(PostgresEvent::All, "public").table("users");
        let server = PostgresFilter::new(PostgresEvent::Update, "public")
            .table("users")
            .with_server_id(17);

        assert_eq!(client, server);
        assert_eq!(hash_of(&client), hash_of(&server));
    }

    #[test]
    fn test_concrete_events_differ() {
        let insert = PostgresFilter::new(PostgresEvent::Insert, "public").table("users");
        let update = PostgresFilter::new(PostgresEvent::Update, "public").table("users");
        assert_ne!(insert, update);
    }

    #[test]
    fn test_server_id_ignored() {
        let a = PostgresFilter::new(PostgresEvent::Insert, "public").with_server_id(1);
        let b = PostgresFilter::new(PostgresEvent::Insert, "public").with_server_id(2);
        assert_eq!(a, b);

        let other_table = PostgresFilter::new(PostgresEvent::Insert, "public").table("x");
        assert_ne!(a, other_table);
    }

    #[test]
    fn test_serialization() {
        let filter = PostgresFilter::new(PostgresEvent::All, "public")
            .table("messages")
            .filter("room_id=eq.1")
            .with_server_id(9);
        let json = serde_json::to_value(&filter).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "event": "*",
                "schema": "public",
                "table": "messages",
                "filter": "room_id=eq.1"
            })
        );

        let parsed: PostgresFilter = serde_json::from_value(serde_json::json!({
            "id": 31, "event": "INSERT", "schema": "public", "table": "messages"
        }))
        .unwrap();
        assert_eq!(parsed.server_id, 31);
        assert!(matches!(parsed.event, PostgresEvent::Insert));
        assert_eq!(parsed.filter, None);
    }
}
