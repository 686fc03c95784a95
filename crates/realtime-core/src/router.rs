//! Inbound message router.
//!
//! Decoded frames are dispatched by topic to the handler each channel
//! registered. System handlers see every frame before topic dispatch.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, trace};

use realtime_protocol::Frame;

/// A frame handler.
pub type FrameHandler = Arc<dyn Fn(&Frame) + Send + Sync + 'static>;

/// Routes inbound frames to channels.
///
/// At most one handler is registered per topic; registering again replaces
/// the previous one.
pub struct MessageRouter {
    /// Channel handlers indexed by full topic.
    channels: DashMap<String, FrameHandler>,
    /// Handlers that observe every frame.
    system: RwLock<Vec<FrameHandler>>,
}

impl MessageRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            system: RwLock::new(Vec::new()),
        }
    }

    /// Dispatch a frame: system handlers first, then the topic's handler.
    pub fn route(&self, frame: &Frame) {
        let system: Vec<FrameHandler> = self.system.read().iter().cloned().collect();
        for handler in &system {
            handler(frame);
        }

        // Clone out so the handler runs without holding a shard lock.
        let handler = self
            .channels
            .get(frame.topic())
            .map(|entry| Arc::clone(entry.value()));

        match handler {
            Some(handler) => handler(frame),
            None => trace!(topic = %frame.topic(), event = %frame.event(), "No channel for topic"),
        }
    }

    /// Register the handler for a topic.
    pub fn register_channel(&self, topic: impl Into<String>, handler: FrameHandler) {
        let topic = topic.into();
        debug!(topic = %topic, "Registered channel handler");
        self.channels.insert(topic, handler);
    }

    /// Remove the handler for a topic. Returns `true` if one was registered.
    pub fn unregister_channel(&self, topic: &str) -> bool {
        let removed = self.channels.remove(topic).is_some();
        if removed {
            debug!(topic = %topic, "Unregistered channel handler");
        }
        removed
    }

    /// Add a handler that observes every routed frame.
    pub fn add_system_handler(&self, handler: FrameHandler) {
        self.system.write().push(handler);
    }

    /// Check whether a topic has a handler.
    #[must_use]
    pub fn has_channel(&self, topic: &str) -> bool {
        self.channels.contains_key(topic)
    }

    /// Number of registered channel handlers.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Remove every handler.
    pub fn reset(&self) {
        self.channels.clear();
        self.system.write().clear();
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("channels", &self.channels.len())
            .field("system", &self.system.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use realtime_protocol::{JsonObject, Message};

    fn frame(topic: &str, event: &str) -> Frame {
        Frame::Message(Message::new(topic, event, JsonObject::new()))
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, FrameHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (
            seen,
            Arc::new(move |frame: &Frame| sink.lock().push(frame.event().to_string())),
        )
    }

    #[test]
    fn test_routes_by_topic() {
        let router = MessageRouter::new();
        let (a_seen, a) = recorder();
        let (b_seen, b) = recorder();
        router.register_channel("realtime:a", a);
        router.register_channel("realtime:b", b);

        router.route(&frame("realtime:a", "one"));
        router.route(&frame("realtime:b", "two"));
        router.route(&frame("realtime:c", "three"));

        assert_eq!(*a_seen.lock(), vec!["one".to_string()]);
        assert_eq!(*b_seen.lock(), vec!["two".to_string()]);
    }

    #[test]
    fn test_system_handlers_run_first() {
        let router = MessageRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        router.register_channel("t", Arc::new(move |_: &Frame| o.lock().push("channel")));
        let o = Arc::clone(&order);
        router.add_system_handler(Arc::new(move |_: &Frame| o.lock().push("system")));

        router.route(&frame("t", "e"));
        router.route(&frame("unknown", "e"));

        assert_eq!(*order.lock(), vec!["system", "channel", "system"]);
    }

    #[test]
    fn test_register_replaces_and_unregister() {
        let router = MessageRouter::new();
        let (first_seen, first) = recorder();
        let (second_seen, second) = recorder();
        router.register_channel("t", first);
        router.register_channel("t", second);
        assert_eq!(router.channel_count(), 1);

        router.route(&frame("t", "e"));
        assert!(first_seen.lock().is_empty());
        assert_eq!(second_seen.lock().len(), 1);

        assert!(router.unregister_channel("t"));
        assert!(!router.unregister_channel("t"));
        router.route(&frame("t", "e"));
        assert_eq!(second_seen.lock().len(), 1);
    }

    #[test]
    fn test_handler_may_unregister_itself() {
        let router = Arc::new(MessageRouter::new());
        let inner = Arc::clone(&router);
        router.register_channel(
            "t",
            Arc::new(move |_: &Frame| {
                inner.unregister_channel("t");
            }),
        );

        router.route(&frame("t", "e"));
        assert!(!router.has_channel("t"));
    }

    #[test]
    fn test_reset() {
        let router = MessageRouter::new();
        let (_, handler) = recorder();
        router.register_channel("t", Arc::clone(&handler));
        router.add_system_handler(handler);

        router.reset();
        assert_eq!(router.channel_count(), 0);
    }
}
