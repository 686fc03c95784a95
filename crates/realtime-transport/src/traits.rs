//! Transport abstraction traits.
//!
//! A transport is one established socket to the server. The connection
//! state machine obtains transports from a [`TransportFactory`] and never
//! depends on a concrete implementation.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// An outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

impl WireFrame {
    /// Size of the frame body in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An inbound transport event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Binary(Bytes),
    /// The peer closed the socket.
    Close { code: u16, reason: String },
}

/// Stream of inbound events. Ends when the socket goes away.
pub type EventStream = BoxStream<'static, Result<TransportEvent, TransportError>>;

/// Close code for a normal client-initiated close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Establishing the socket failed.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No connection is established.
    #[error("Not connected")]
    NotConnected,

    /// The server stopped acknowledging heartbeats.
    #[error("Heartbeat timed out")]
    HeartbeatTimeout,

    /// The operation was cancelled by a disconnect.
    #[error("Operation cancelled")]
    Cancelled,

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] realtime_protocol::ProtocolError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Check whether this error only reports a cancellation.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

/// An established socket.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a frame.
    async fn send(&self, frame: WireFrame) -> Result<(), TransportError>;

    /// Close the socket with a close code and reason.
    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError>;

    /// Take the inbound event stream. Returns `None` once taken.
    fn events(&self) -> Option<EventStream>;

    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;
}

/// Opens transports.
///
/// Dropping the returned future must abandon the attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_frame_len() {
        assert_eq!(WireFrame::Text("abc".into()).len(), 3);
        assert!(WireFrame::Binary(Bytes::new()).is_empty());
    }

    #[test]
    fn test_cancellation_classification() {
        assert!(TransportError::Cancelled.is_cancellation());
        assert!(!TransportError::ConnectionClosed.is_cancellation());
        assert!(!TransportError::HeartbeatTimeout.is_cancellation());
    }
}
