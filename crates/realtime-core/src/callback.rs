//! Callback registry for channel events.
//!
//! Every registration gets an id from a per-registry counter; the id is the
//! only handle needed to remove it again. Matching callbacks are collected
//! while the registry lock is held and invoked after it is released, so a
//! callback may register or remove callbacks without deadlocking.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

use crate::filter::PostgresFilter;
use crate::postgres::PostgresAction;
use crate::presence::PresenceState;
use realtime_protocol::{JsonObject, Message};

/// Identifier of a registered callback.
pub type CallbackId = u64;

/// Wildcard broadcast event.
pub const ANY_EVENT: &str = "*";

pub type PostgresCallback = Arc<dyn Fn(&PostgresAction) + Send + Sync + 'static>;
pub type BroadcastCallback = Arc<dyn Fn(&JsonObject) + Send + Sync + 'static>;
pub type BroadcastDataCallback = Arc<dyn Fn(&str, &Bytes) + Send + Sync + 'static>;
pub type PresenceCallback = Arc<dyn Fn(&PresenceChange) + Send + Sync + 'static>;
pub type SystemCallback = Arc<dyn Fn(&Message) + Send + Sync + 'static>;

/// A presence update as delivered to presence callbacks.
#[derive(Debug, Clone)]
pub struct PresenceChange {
    pub joins: PresenceState,
    pub leaves: PresenceState,
    /// The message the update arrived in.
    pub raw: Message,
}

/// A registered callback.
#[derive(Clone)]
pub enum CallbackRecord {
    Postgres {
        id: CallbackId,
        filter: PostgresFilter,
        callback: PostgresCallback,
    },
    Broadcast {
        id: CallbackId,
        event: String,
        callback: BroadcastCallback,
    },
    BroadcastBinary {
        id: CallbackId,
        event: String,
        callback: BroadcastDataCallback,
    },
    Presence {
        id: CallbackId,
        callback: PresenceCallback,
    },
    System {
        id: CallbackId,
        callback: SystemCallback,
    },
}

impl CallbackRecord {
    /// The record's id.
    #[must_use]
    pub fn id(&self) -> CallbackId {
        match self {
            CallbackRecord::Postgres { id, .. }
            | CallbackRecord::Broadcast { id, .. }
            | CallbackRecord::BroadcastBinary { id, .. }
            | CallbackRecord::Presence { id, .. }
            | CallbackRecord::System { id, .. } => *id,
        }
    }
}

impl std::fmt::Debug for CallbackRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackRecord::Postgres { id, filter, .. } => f
                .debug_struct("Postgres")
                .field("id", id)
                .field("filter", filter)
                .finish(),
            CallbackRecord::Broadcast { id, event, .. } => f
                .debug_struct("Broadcast")
                .field("id", id)
                .field("event", event)
                .finish(),
            CallbackRecord::BroadcastBinary { id, event, .. } => f
                .debug_struct("BroadcastBinary")
                .field("id", id)
                .field("event", event)
                .finish(),
            CallbackRecord::Presence { id, .. } => {
                f.debug_struct("Presence").field("id", id).finish()
            }
            CallbackRecord::System { id, .. } => f.debug_struct("System").field("id", id).finish(),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    next_id: CallbackId,
    records: Vec<CallbackRecord>,
    server_changes: Vec<PostgresFilter>,
}

impl RegistryState {
    fn push(&mut self, make: impl FnOnce(CallbackId) -> CallbackRecord) -> CallbackId {
        self.next_id += 1;
        let id = self.next_id;
        self.records.push(make(id));
        id
    }
}

fn event_matches(registered: &str, event: &str) -> bool {
    registered == ANY_EVENT || registered.eq_ignore_ascii_case(event)
}

/// Callback registry of one channel.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    state: Mutex<RegistryState>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_postgres_callback(
        &self,
        filter: PostgresFilter,
        callback: PostgresCallback,
    ) -> CallbackId {
        self.state.lock().push(|id| CallbackRecord::Postgres {
            id,
            filter,
            callback,
        })
    }

    pub fn add_broadcast_callback(
        &self,
        event: impl Into<String>,
        callback: BroadcastCallback,
    ) -> CallbackId {
        let event = event.into();
        self.state.lock().push(|id| CallbackRecord::Broadcast {
            id,
            event,
            callback,
        })
    }

    pub fn add_broadcast_data_callback(
        &self,
        event: impl Into<String>,
        callback: BroadcastDataCallback,
    ) -> CallbackId {
        let event = event.into();
        self.state.lock().push(|id| CallbackRecord::BroadcastBinary {
            id,
            event,
            callback,
        })
    }

    pub fn add_presence_callback(&self, callback: PresenceCallback) -> CallbackId {
        self.state
            .lock()
            .push(|id| CallbackRecord::Presence { id, callback })
    }

    pub fn add_system_callback(&self, callback: SystemCallback) -> CallbackId {
        self.state
            .lock()
            .push(|id| CallbackRecord::System { id, callback })
    }

    /// Remove a callback. Returns `true` if it was registered.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut state = self.state.lock();
        let before = state.records.len();
        state.records.retain(|r| r.id() != id);
        state.records.len() != before
    }

    /// Replace the filters the server confirmed in its join reply.
    pub fn set_server_changes(&self, filters: Vec<PostgresFilter>) {
        self.state.lock().server_changes = filters;
    }

    /// Filters the server confirmed for the current join.
    #[must_use]
    pub fn server_changes(&self) -> Vec<PostgresFilter> {
        self.state.lock().server_changes.clone()
    }

    /// Filters declared by postgres callbacks, in registration order.
    #[must_use]
    pub fn postgres_filters(&self) -> Vec<PostgresFilter> {
        self.state
            .lock()
            .records
            .iter()
            .filter_map(|r| match r {
                CallbackRecord::Postgres { filter, .. } => Some(filter.clone()),
                _ => None,
            })
            .collect()
    }

    /// Check whether any presence callback is registered.
    #[must_use]
    pub fn has_presence_callbacks(&self) -> bool {
        self.state
            .lock()
            .records
            .iter()
            .any(|r| matches!(r, CallbackRecord::Presence { .. }))
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Check whether no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every callback and confirmed filter. The id counter keeps going.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.records.clear();
        state.server_changes.clear();
    }

    /// Invoke postgres callbacks whose filter matches a confirmed filter
    /// listed in `ids`.
    pub fn trigger_postgres_changes(&self, ids: &[i64], action: &PostgresAction) {
        let callbacks: Vec<PostgresCallback> = {
            let state = self.state.lock();
            let selected: Vec<&PostgresFilter> = state
                .server_changes
                .iter()
                .filter(|f| ids.contains(&f.server_id))
                .collect();

            state
                .records
                .iter()
                .filter_map(|r| match r {
                    CallbackRecord::Postgres {
                        filter, callback, ..
                    } if selected.iter().any(|s| *s == filter) => Some(Arc::clone(callback)),
                    _ => None,
                })
                .collect()
        };

        trace!(ids = ?ids, matched = callbacks.len(), "Dispatching postgres change");
        for callback in callbacks {
            callback(action);
        }
    }

    /// Invoke broadcast callbacks registered for `event` or `*`.
    pub fn trigger_broadcast(&self, event: &str, payload: &JsonObject) {
        let callbacks: Vec<BroadcastCallback> = {
            let state = self.state.lock();
            state
                .records
                .iter()
                .filter_map(|r| match r {
                    CallbackRecord::Broadcast {
                        event: registered,
                        callback,
                        ..
                    } if event_matches(registered, event) => Some(Arc::clone(callback)),
                    _ => None,
                })
                .collect()
        };

        for callback in callbacks {
            callback(payload);
        }
    }

    /// Invoke binary broadcast callbacks registered for `event` or `*`.
    pub fn trigger_broadcast_data(&self, event: &str, data: &Bytes) {
        let callbacks: Vec<BroadcastDataCallback> = {
            let state = self.state.lock();
            state
                .records
                .iter()
                .filter_map(|r| match r {
                    CallbackRecord::BroadcastBinary {
                        event: registered,
                        callback,
                        ..
                    } if event_matches(registered, event) => Some(Arc::clone(callback)),
                    _ => None,
                })
                .collect()
        };

        for callback in callbacks {
            callback(event, data);
        }
    }

    /// Invoke every presence callback.
    pub fn trigger_presence_diffs(&self, joins: PresenceState, leaves: PresenceState, raw: Message) {
        let callbacks: Vec<PresenceCallback> = {
            let state = self.state.lock();
            state
                .records
                .iter()
                .filter_map(|r| match r {
                    CallbackRecord::Presence { callback, .. } => Some(Arc::clone(callback)),
                    _ => None,
                })
                .collect()
        };

        if callbacks.is_empty() {
            return;
        }
        let change = PresenceChange { joins, leaves, raw };
        for callback in callbacks {
            callback(&change);
        }
    }

    /// Invoke every system callback.
    pub fn trigger_system(&self, message: &Message) {
        let callbacks: Vec<SystemCallback> = {
            let state = self.state.lock();
            state
                .records
                .iter()
                .filter_map(|r| match r {
                    CallbackRecord::System { callback, .. } => Some(Arc::clone(callback)),
                    _ => None,
                })
                .collect()
        };

        for callback in callbacks {
            callback(message);
        }
    }
}
