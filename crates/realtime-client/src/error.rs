//! Client error type.

use thiserror::Error;

use realtime_protocol::ProtocolError;
use realtime_transport::TransportError;

use crate::rest::FallbackError;

/// Errors returned by client and channel operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Subscribe gave up after the configured number of join attempts.
    #[error("Gave up after {attempts} join attempts")]
    MaxRetryAttemptsReached { attempts: u32 },

    /// The channel was used in a way its current state does not allow.
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The server rejected a join.
    #[error("Join rejected for {0}")]
    JoinRejected(String),

    /// The endpoint URL is invalid.
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The access token was rejected locally.
    #[error("Invalid access token: {0}")]
    InvalidToken(String),

    /// The client this channel belongs to was dropped.
    #[error("Client dropped")]
    ClientDropped,

    /// HTTP broadcast fallback error.
    #[error("Fallback error: {0}")]
    Fallback(#[from] FallbackError),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RealtimeError {
    /// Short label used for the `type` metric dimension.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RealtimeError::Transport(_) => "transport",
            RealtimeError::Protocol(_) => "protocol",
            RealtimeError::Timeout(_) => "timeout",
            RealtimeError::MaxRetryAttemptsReached { .. } => "max_retries",
            RealtimeError::ContractViolation(_) => "contract",
            RealtimeError::Cancelled => "cancelled",
            RealtimeError::JoinRejected(_) => "join_rejected",
            RealtimeError::InvalidUrl(_) => "url",
            RealtimeError::InvalidToken(_) => "token",
            RealtimeError::ClientDropped => "client_dropped",
            RealtimeError::Fallback(_) => "fallback",
            RealtimeError::Json(_) => "json",
        }
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;
