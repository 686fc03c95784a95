//! Heartbeat liveness monitor.
//!
//! While started, the monitor ticks at a fixed interval. A tick that finds
//! the previous heartbeat still unacknowledged reports a timeout and sends
//! nothing; otherwise it sends a fresh heartbeat and records its ref.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Heartbeat lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    /// A heartbeat was sent.
    Sent,
    /// The pending heartbeat was acknowledged.
    Ok,
    /// The pending heartbeat was not acknowledged within one interval.
    Timeout,
}

/// What the monitor needs from its owner.
#[async_trait]
pub trait HeartbeatHandler: Send + Sync + 'static {
    /// Allocate the ref for the next heartbeat.
    fn next_ref(&self) -> String;

    /// Transmit a heartbeat with the given ref.
    async fn send_heartbeat(&self, heartbeat_ref: String);

    /// Called when a heartbeat went unacknowledged.
    fn on_timeout(&self);

    /// Observe heartbeat status changes.
    fn on_status(&self, _status: HeartbeatStatus) {}
}

/// Periodic heartbeat monitor.
pub struct HeartbeatMonitor {
    interval: Duration,
    handler: Arc<dyn HeartbeatHandler>,
    pending: Arc<Mutex<Option<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    /// Create a stopped monitor.
    #[must_use]
    pub fn new(interval: Duration, handler: Arc<dyn HeartbeatHandler>) -> Self {
        Self {
            interval,
            handler,
            pending: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    /// The tick interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the loop, replacing any running one. The first tick happens one
    /// interval from now.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *self.pending.lock() = None;

        let period = self.interval;
        let handler = Arc::clone(&self.handler);
        let pending = Arc::clone(&self.pending);

        *task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let unacknowledged = pending.lock().take();
                if let Some(heartbeat_ref) = unacknowledged {
                    warn!(heartbeat_ref = %heartbeat_ref, "Heartbeat timed out");
                    handler.on_status(HeartbeatStatus::Timeout);
                    handler.on_timeout();
                    continue;
                }

                let heartbeat_ref = handler.next_ref();
                *pending.lock() = Some(heartbeat_ref.clone());
                trace!(heartbeat_ref = %heartbeat_ref, "Sending heartbeat");
                handler.send_heartbeat(heartbeat_ref).await;
                handler.on_status(HeartbeatStatus::Sent);
            }
        }));

        debug!(interval = ?period, "Heartbeat started");
    }

    /// Stop the loop. Safe to call when not started.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("Heartbeat stopped");
        }
        *self.pending.lock() = None;
    }

    /// Check whether the loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Ref of the heartbeat awaiting acknowledgement.
    #[must_use]
    pub fn pending_ref(&self) -> Option<String> {
        self.pending.lock().clone()
    }

    /// Record a heartbeat reply. Only a reply to the pending ref clears it;
    /// returns whether it did.
    pub fn on_heartbeat_response(&self, heartbeat_ref: &str) -> bool {
        let cleared = {
            let mut pending = self.pending.lock();
            if pending.as_deref() == Some(heartbeat_ref) {
                *pending = None;
                true
            } else {
                false
            }
        };

        if cleared {
            trace!(heartbeat_ref = %heartbeat_ref, "Heartbeat acknowledged");
            self.handler.on_status(HeartbeatStatus::Ok);
        }
        cleared
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("interval", &self.interval)
            .field("pending", &*self.pending.lock())
            .finish()
    }
}
