//! Presence synchronization.
//!
//! The server reports presence either as a full snapshot (`presence_state`,
//! sent after every join) or as an incremental diff (`presence_diff`). Both
//! are folded into one merged [`PresenceState`] by the pure functions
//! [`sync_state`] and [`sync_diff`]. A snapshot is first turned into a diff
//! against the current state, so reconnects and incremental updates share
//! one merge algorithm.
//!
//! Every entry carries a server-issued ref that identifies one connection, so
//! a single key can be present from several devices at once. Removing one
//! ref never removes its siblings.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, trace};

use realtime_protocol::JsonObject;

/// Wire name of the per-connection presence ref.
pub const PRESENCE_REF_KEY: &str = "phx_ref";

/// Wire name of the ref an updated entry replaces.
pub const PRESENCE_REF_PREV_KEY: &str = "phx_ref_prev";

/// One connection's presence under a key.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    /// Server-issued per-connection ref.
    pub presence_ref: String,
    /// User-defined tracked state.
    pub state: JsonObject,
}

impl PresenceEntry {
    /// Create an entry.
    #[must_use]
    pub fn new(presence_ref: impl Into<String>, state: JsonObject) -> Self {
        Self {
            presence_ref: presence_ref.into(),
            state,
        }
    }
}

/// Presence key to the live entries under it.
pub type PresenceState = BTreeMap<String, Vec<PresenceEntry>>;

/// Joins and leaves to apply to a [`PresenceState`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceDiff {
    pub joins: PresenceState,
    pub leaves: PresenceState,
}

impl PresenceDiff {
    /// Check whether the diff changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

fn refs_of(entries: &[PresenceEntry]) -> HashSet<&str> {
    entries.iter().map(|e| e.presence_ref.as_str()).collect()
}

/// Fold a full snapshot into `current`.
///
/// Keys missing from the snapshot leave entirely, new keys join entirely,
/// and keys present on both sides produce partial joins and leaves holding
/// only the refs that differ. The result is applied with [`sync_diff`].
pub fn sync_state<J, L>(
    current: &PresenceState,
    snapshot: &PresenceState,
    on_join: J,
    on_leave: L,
) -> PresenceState
where
    J: FnMut(&str, Option<&[PresenceEntry]>, &[PresenceEntry]),
    L: FnMut(&str, &[PresenceEntry], &[PresenceEntry]),
{
    let mut diff = PresenceDiff::default();

    for (name, entries) in current {
        if !snapshot.contains_key(name) {
            diff.leaves.insert(name.clone(), entries.clone());
        }
    }

    for (name, new_entries) in snapshot {
        let Some(current_entries) = current.get(name) else {
            diff.joins.insert(name.clone(), new_entries.clone());
            continue;
        };

        let current_refs = refs_of(current_entries);
        let new_refs = refs_of(new_entries);

        let joined: Vec<_> = new_entries
            .iter()
            .filter(|e| !current_refs.contains(e.presence_ref.as_str()))
            .cloned()
            .collect();
        let left: Vec<_> = current_entries
            .iter()
            .filter(|e| !new_refs.contains(e.presence_ref.as_str()))
            .cloned()
            .collect();

        if !joined.is_empty() {
            diff.joins.insert(name.clone(), joined);
        }
        if !left.is_empty() {
            diff.leaves.insert(name.clone(), left);
        }
    }

    sync_diff(current, &diff, on_join, on_leave)
}

/// Apply a diff to `current`.
///
/// A join replaces the key's entries with the joined ones, preceded by any
/// previous entries whose refs the join does not mention. `on_join` receives
/// the previous entries and the merged result. A leave removes exactly the
/// listed refs; `on_leave` receives what remains, and keys left with no
/// entries are removed.
pub fn sync_diff<J, L>(
    current: &PresenceState,
    diff: &PresenceDiff,
    mut on_join: J,
    mut on_leave: L,
) -> PresenceState
where
    J: FnMut(&str, Option<&[PresenceEntry]>, &[PresenceEntry]),
    L: FnMut(&str, &[PresenceEntry], &[PresenceEntry]),
{
    let mut state = current.clone();

    for (name, new_entries) in &diff.joins {
        let previous = state.get(name).cloned();
        let merged = match &previous {
            Some(previous_entries) => {
                let joined_refs = refs_of(new_entries);
                previous_entries
                    .iter()
                    .filter(|e| !joined_refs.contains(e.presence_ref.as_str()))
                    .chain(new_entries.iter())
                    .cloned()
                    .collect()
            }
            None => new_entries.clone(),
        };

        state.insert(name.clone(), merged);
        on_join(name, previous.as_deref(), &state[name]);
    }

    for (name, left_entries) in &diff.leaves {
        let now_empty = {
            let Some(entries) = state.get_mut(name) else {
                continue;
            };
            let left_refs = refs_of(left_entries);
            entries.retain(|e| !left_refs.contains(e.presence_ref.as_str()));
            on_leave(name, entries, left_entries);
            entries.is_empty()
        };

        if now_empty {
            state.remove(name);
        }
    }

    state
}

/// Decode a server presence map: `{key: {metas: [{phx_ref, ...state}]}}`.
#[must_use]
pub fn decode_state(payload: &JsonObject) -> PresenceState {
    payload
        .iter()
        .filter_map(|(name, value)| {
            let metas = value.get("metas").and_then(Value::as_array)?;
            let entries: Vec<_> = metas.iter().filter_map(decode_entry).collect();
            Some((name.clone(), entries))
        })
        .collect()
}

/// Decode a `presence_diff` payload: `{joins: {...}, leaves: {...}}`.
#[must_use]
pub fn decode_diff(payload: &JsonObject) -> PresenceDiff {
    let section = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_object)
            .map(decode_state)
            .unwrap_or_default()
    };

    PresenceDiff {
        joins: section("joins"),
        leaves: section("leaves"),
    }
}

fn decode_entry(meta: &Value) -> Option<PresenceEntry> {
    let mut state = meta.as_object()?.clone();
    let presence_ref = match state.remove(PRESENCE_REF_KEY) {
        Some(Value::String(r)) => r,
        _ => {
            debug!("Presence entry without {} skipped", PRESENCE_REF_KEY);
            return None;
        }
    };
    state.remove(PRESENCE_REF_PREV_KEY);
    Some(PresenceEntry::new(presence_ref, state))
}

/// Merged presence state of one channel.
///
/// Diffs that arrive before the snapshot of the current join are buffered
/// and replayed on top of that snapshot.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    state: PresenceState,
    join_ref: Option<String>,
    synced_join_ref: Option<String>,
    pending: Vec<PresenceDiff>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new join attempt. Diffs are buffered until its snapshot.
    pub fn begin_join(&mut self, join_ref: impl Into<String>) {
        self.join_ref = Some(join_ref.into());
        self.pending.clear();
    }

    /// Check whether the snapshot of the current join is still outstanding.
    #[must_use]
    pub fn in_pending_sync(&self) -> bool {
        self.join_ref.is_none() || self.join_ref != self.synced_join_ref
    }

    /// Apply a full snapshot, then any buffered diffs.
    pub fn apply_state(&mut self, snapshot: &PresenceState) {
        self.state = sync_state(&self.state, snapshot, log_join, log_leave);
        self.synced_join_ref = self.join_ref.clone();

        for diff in std::mem::take(&mut self.pending) {
            self.state = sync_diff(&self.state, &diff, log_join, log_leave);
        }
    }

    /// Apply an incremental diff, or buffer it while a snapshot is pending.
    pub fn apply_diff(&mut self, diff: PresenceDiff) {
        if self.in_pending_sync() {
            trace!("Buffering presence diff until state arrives");
            self.pending.push(diff);
            return;
        }
        self.state = sync_diff(&self.state, &diff, log_join, log_leave);
    }

    /// Current merged state.
    #[must_use]
    pub fn list(&self) -> &PresenceState {
        &self.state
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

fn log_join(name: &str, _previous: Option<&[PresenceEntry]>, entries: &[PresenceEntry]) {
    trace!(key = %name, entries = entries.len(), "Presence join");
}

fn log_leave(name: &str, remaining: &[PresenceEntry], _left: &[PresenceEntry]) {
    trace!(key = %name, remaining = remaining.len(), "Presence leave");
}
