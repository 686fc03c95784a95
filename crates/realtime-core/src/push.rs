//! Request/reply correlation for pushes that expect an acknowledgement.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use realtime_protocol::Message;

/// Outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Ok,
    Error,
    Timeout,
}

impl PushStatus {
    /// Parse the `status` member of a reply. Unknown values count as errors.
    #[must_use]
    pub fn from_reply(status: &str) -> Self {
        match status {
            "ok" => PushStatus::Ok,
            "timeout" => PushStatus::Timeout,
            _ => PushStatus::Error,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PushStatus::Ok => "ok",
            PushStatus::Error => "error",
            PushStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for PushStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A push awaiting its reply. The first resolution wins.
#[derive(Debug)]
pub struct PendingPush {
    message: Message,
    push_ref: String,
    resolution: Mutex<Option<oneshot::Sender<PushStatus>>>,
}

impl PendingPush {
    /// The message that was pushed.
    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The push ref.
    #[must_use]
    pub fn push_ref(&self) -> &str {
        &self.push_ref
    }

    /// Resolve the push. Returns `false` if it was already resolved.
    pub fn did_receive(&self, status: PushStatus) -> bool {
        match self.resolution.lock().take() {
            Some(sender) => {
                // The waiter may be gone; the push still counts as resolved.
                let _ = sender.send(status);
                true
            }
            None => false,
        }
    }
}

/// Receives the resolution of one pending push.
#[derive(Debug)]
pub struct PushWaiter {
    push_ref: String,
    receiver: oneshot::Receiver<PushStatus>,
    registry: Arc<DashMap<String, Arc<PendingPush>>>,
}

impl PushWaiter {
    /// The ref being waited on.
    #[must_use]
    pub fn push_ref(&self) -> &str {
        &self.push_ref
    }

    /// Wait for the reply, yielding [`PushStatus::Timeout`] if none arrives
    /// in time. The pending entry is removed either way, including when the
    /// waiter is dropped before it resolves.
    pub async fn wait(mut self, timeout: Duration) -> PushStatus {
        let status = match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(status)) => status,
            // Sender dropped without resolving: the registry was cleared.
            Ok(Err(_)) => PushStatus::Error,
            Err(_) => {
                if let Some((_, pending)) = self.registry.remove(&self.push_ref) {
                    pending.did_receive(PushStatus::Timeout);
                }
                debug!(push_ref = %self.push_ref, "Push timed out");
                PushStatus::Timeout
            }
        };
        status
    }
}

impl Drop for PushWaiter {
    fn drop(&mut self) {
        self.registry.remove(&self.push_ref);
    }
}

/// Pending pushes indexed by ref.
#[derive(Debug, Default)]
pub struct PushRegistry {
    pending: Arc<DashMap<String, Arc<PendingPush>>>,
}

impl PushRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a push. The message must carry its ref.
    pub fn register(&self, message: Message) -> PushWaiter {
        let push_ref = message.msg_ref.clone().unwrap_or_default();
        let (sender, receiver) = oneshot::channel();
        let pending = Arc::new(PendingPush {
            message,
            push_ref: push_ref.clone(),
            resolution: Mutex::new(Some(sender)),
        });

        self.pending.insert(push_ref.clone(), pending);
        trace!(push_ref = %push_ref, "Registered pending push");

        PushWaiter {
            push_ref,
            receiver,
            registry: Arc::clone(&self.pending),
        }
    }

    /// Resolve and remove the push with the given ref. Returns `false` if no
    /// push was pending under it.
    pub fn resolve(&self, push_ref: &str, status: PushStatus) -> bool {
        match self.pending.remove(push_ref) {
            Some((_, pending)) => {
                trace!(push_ref = %push_ref, status = %status, "Resolved push");
                pending.did_receive(status)
            }
            None => false,
        }
    }

    /// Check whether a push is pending under the ref.
    #[must_use]
    pub fn contains(&self, push_ref: &str) -> bool {
        self.pending.contains_key(push_ref)
    }

    /// Number of pending pushes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Resolve every pending push with `status`.
    pub fn resolve_all(&self, status: PushStatus) {
        let refs: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for push_ref in refs {
            self.resolve(&push_ref, status);
        }
    }
}
