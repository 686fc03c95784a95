//! # realtime-transport
//!
//! Transport layer of the realtime channels client.
//!
//! This crate provides:
//!
//! - **Traits** - `Transport` and `TransportFactory`, so the client never
//!   depends on a concrete socket
//! - **Connection** - The connection state machine with single-flight
//!   connects, cancellation and reconnect after errors
//! - **WebSocket** - tokio-tungstenite client transport (feature `websocket`)
//! - **Memory** - In-process transport for tests and embedding
//!
//! ```rust,ignore
//! use realtime_transport::{ConnectionConfig, ConnectionManager, WebSocketFactory};
//!
//! let (connection, mut events) = ConnectionManager::new(
//!     ConnectionConfig::new("wss://example.com/realtime/v1/websocket"),
//!     Arc::new(WebSocketFactory::new()),
//! );
//! connection.connect().await?;
//! while let Some(event) = events.recv().await {
//!     // Decode and route
//! }
//! ```

pub mod connection;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionStatus};
pub use memory::{memory_transport, MemoryListener, MemoryTransportFactory, ServerEnd};
pub use traits::{
    EventStream, Transport, TransportError, TransportEvent, TransportFactory, WireFrame,
    CLOSE_NORMAL,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketFactory, WebSocketTransport};
