//! Client metrics.
//!
//! Uses the `metrics` facade; installing a recorder is left to the
//! application.

use metrics::{counter, gauge};

use crate::error::RealtimeError;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "realtime_connections_total";
    pub const CONNECTION_ACTIVE: &str = "realtime_connection_active";
    pub const RECONNECTS_TOTAL: &str = "realtime_reconnects_total";
    pub const MESSAGES_TOTAL: &str = "realtime_messages_total";
    pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "realtime_heartbeat_timeouts_total";
    pub const CHANNEL_JOINS_TOTAL: &str = "realtime_channel_joins_total";
    pub const ERRORS_TOTAL: &str = "realtime_errors_total";
}

/// Describe every metric once.
pub fn describe_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of established connections"
    );
    metrics::describe_gauge!(
        names::CONNECTION_ACTIVE,
        "1 while a connection is established, 0 otherwise"
    );
    metrics::describe_counter!(names::RECONNECTS_TOTAL, "Total number of reconnects scheduled");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames sent and received");
    metrics::describe_counter!(
        names::HEARTBEAT_TIMEOUTS_TOTAL,
        "Total number of unacknowledged heartbeats"
    );
    metrics::describe_counter!(names::CHANNEL_JOINS_TOTAL, "Total number of successful channel joins");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
}

/// Record an established connection.
pub fn record_connected() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTION_ACTIVE).set(1.0);
}

/// Record a lost or closed connection.
pub fn record_disconnected() {
    gauge!(names::CONNECTION_ACTIVE).set(0.0);
}

/// Record a scheduled reconnect.
pub fn record_reconnect() {
    counter!(names::RECONNECTS_TOTAL).increment(1);
    gauge!(names::CONNECTION_ACTIVE).set(0.0);
}

/// Record a frame.
pub fn record_message(direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
}

/// Record a heartbeat timeout.
pub fn record_heartbeat_timeout() {
    counter!(names::HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
}

/// Record a successful join.
pub fn record_channel_join() {
    counter!(names::CHANNEL_JOINS_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Record a client error under its kind.
pub fn record_failure(error: &RealtimeError) {
    record_error(error.kind());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        // No recorder installed: every call is a no-op.
        describe_metrics();
        record_connected();
        record_message("inbound");
        record_error("protocol");
        record_failure(&RealtimeError::Cancelled);
        record_disconnected();
    }
}
