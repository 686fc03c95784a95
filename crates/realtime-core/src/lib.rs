//! # realtime-core
//!
//! Protocol engine pieces shared by the realtime channels client.
//!
//! This crate provides the building blocks the client composes:
//!
//! - **Router** - Dispatches inbound frames by topic
//! - **Callbacks** - Typed user callbacks and their matching rules
//! - **Presence** - Snapshot and diff synchronization
//! - **Heartbeat** - Liveness probing
//! - **Push** - Request/reply correlation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Router    │────▶│  Channel    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                                │
//!                                 ┌──────────────┼──────────────┐
//!                                 ▼              ▼              ▼
//!                          ┌───────────┐  ┌───────────┐  ┌───────────┐
//!                          │ Callbacks │  │ Presence  │  │   Push    │
//!                          └───────────┘  └───────────┘  └───────────┘
//! ```

pub mod backoff;
pub mod callback;
pub mod filter;
pub mod heartbeat;
pub mod join;
pub mod postgres;
pub mod presence;
pub mod push;
pub mod refs;
pub mod router;

pub use backoff::Backoff;
pub use callback::{CallbackId, CallbackRegistry, PresenceChange};
pub use filter::{PostgresEvent, PostgresFilter};
pub use heartbeat::{HeartbeatHandler, HeartbeatMonitor, HeartbeatStatus};
pub use join::{BroadcastJoinConfig, JoinConfig, JoinPayload, PresenceJoinConfig, ReplayOption};
pub use postgres::{decode_change, ChangeType, Column, PostgresAction, PostgresChange};
pub use presence::{PresenceDiff, PresenceEntry, PresenceState, PresenceTracker};
pub use push::{PendingPush, PushRegistry, PushStatus, PushWaiter};
pub use refs::RefGenerator;
pub use router::{FrameHandler, MessageRouter};
