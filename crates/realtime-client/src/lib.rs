//! # realtime-client
//!
//! Client for realtime channels: postgres change feeds, broadcast and
//! presence multiplexed over one socket.
//!
//! - **Client** - Owns the socket, buffers pushes, heartbeats and rejoins
//! - **Channel** - One joined topic with its callbacks and presence
//! - **Auth** - Access tokens and expiry checks
//! - **Fallback** - HTTP delivery of broadcasts while not joined
//!
//! ## Example
//!
//! ```rust,ignore
//! use realtime_client::{ChannelOptions, ClientConfig, PostgresEvent, PostgresFilter, RealtimeClient};
//!
//! let client = RealtimeClient::new(
//!     "wss://project.example.co/realtime/v1",
//!     ClientConfig::default().with_api_key("anon-key"),
//! )?;
//!
//! let channel = client.channel("public:messages", ChannelOptions::default());
//! channel.on_postgres_changes(
//!     PostgresFilter::new(PostgresEvent::Insert, "public").table("messages"),
//!     |change| println!("{:?}", change.change_type()),
//! )?;
//! channel.subscribe().await?;
//! ```

pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod rest;

pub use auth::{AccessTokenProvider, StaticTokenProvider};
pub use channel::{ChannelOptions, ChannelStatus, RealtimeChannel, Subscription};
pub use client::{RealtimeClient, RealtimeClientBuilder};
pub use config::{ClientConfig, RetryConfig};
pub use error::{RealtimeError, Result};
pub use rest::{BroadcastFallback, FallbackError, FallbackMessage, HttpBroadcastFallback};

pub use realtime_core::{
    BroadcastJoinConfig, ChangeType, HeartbeatStatus, PostgresAction, PostgresEvent,
    PostgresFilter, PresenceChange, PresenceEntry, PresenceState, PushStatus, ReplayOption,
};
pub use realtime_protocol::{Frame, JsonObject, Message};
pub use realtime_transport::{ConnectionStatus, TransportFactory};
