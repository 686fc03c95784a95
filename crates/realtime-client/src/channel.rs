//! Channels.
//!
//! A channel is one topic joined over the shared socket. It owns the
//! callbacks registered for the topic, its presence state and the pushes
//! awaiting replies, and drives its own join lifecycle:
//!
//! ```text
//! Unsubscribed ──subscribe()──▶ Subscribing ──join ok──▶ Subscribed
//!      ▲                            │                        │
//!      │  retries exhausted,        │                        │ unsubscribe()
//!      │  cancelled                 │                        ▼
//!      └────────────────────────────┴─────────────────── Unsubscribing
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use realtime_core::callback::{
    BroadcastCallback, BroadcastDataCallback, PostgresCallback, PresenceCallback, SystemCallback,
};
use realtime_core::presence::{decode_diff, decode_state};
use realtime_core::{
    decode_change, BroadcastJoinConfig, CallbackId, CallbackRegistry, JoinConfig, JoinPayload,
    PostgresAction, PostgresFilter, PresenceChange, PresenceJoinConfig, PresenceState,
    PresenceTracker, PushRegistry, PushStatus,
};
use realtime_protocol::{
    encode_broadcast_push, events, BroadcastPayload, BroadcastPush, Frame, JsonObject, Message,
};
use realtime_transport::WireFrame;

use crate::client::ClientInner;
use crate::error::{RealtimeError, Result};
use crate::metrics;
use crate::rest::{FallbackError, FallbackMessage};

/// Prefix every channel topic carries on the wire.
pub const TOPIC_PREFIX: &str = "realtime:";

/// Add the `realtime:` prefix unless the topic already has it.
#[must_use]
pub fn normalize_topic(topic: &str) -> String {
    if topic.starts_with(TOPIC_PREFIX) {
        topic.to_string()
    } else {
        format!("{}{}", TOPIC_PREFIX, topic)
    }
}

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

impl ChannelStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Unsubscribed => "unsubscribed",
            ChannelStatus::Subscribing => "subscribing",
            ChannelStatus::Subscribed => "subscribed",
            ChannelStatus::Unsubscribing => "unsubscribing",
        }
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-channel join settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelOptions {
    /// Broadcast settings sent with every join.
    pub broadcast: BroadcastJoinConfig,
    /// Key this client is tracked under. Empty lets the server pick.
    pub presence_key: String,
    /// Join as a private channel.
    pub private: bool,
}

impl ChannelOptions {
    /// Request acknowledgements for broadcasts.
    #[must_use]
    pub fn with_ack(mut self, ack: bool) -> Self {
        self.broadcast.ack = ack;
        self
    }

    /// Receive this client's own broadcasts.
    #[must_use]
    pub fn with_self_broadcast(mut self, enabled: bool) -> Self {
        self.broadcast.self_broadcast = enabled;
        self
    }

    #[must_use]
    pub fn with_presence_key(mut self, key: impl Into<String>) -> Self {
        self.presence_key = key.into();
        self
    }

    #[must_use]
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }
}

/// Handle to a registered callback.
///
/// Dropping the handle keeps the callback registered; call
/// [`Subscription::cancel`] to remove it.
#[derive(Debug, Clone)]
pub struct Subscription {
    channel: Weak<ChannelInner>,
    id: CallbackId,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Remove the callback. Returns `false` if it was already removed.
    pub fn cancel(&self) -> bool {
        self.channel
            .upgrade()
            .is_some_and(|channel| channel.callbacks.remove_callback(self.id))
    }
}

pub(crate) struct ChannelInner {
    topic: String,
    options: ChannelOptions,
    client: Weak<ClientInner>,
    callbacks: CallbackRegistry,
    pushes: PushRegistry,
    presence: Mutex<PresenceTracker>,
    status: watch::Sender<ChannelStatus>,
    join_ref: Mutex<Option<String>>,
    subscribe_cancel: Mutex<Option<CancellationToken>>,
    subscribe_epoch: AtomicU64,
    needs_rejoin: AtomicBool,
}

impl ChannelInner {
    fn client(&self) -> Result<Arc<ClientInner>> {
        self.client.upgrade().ok_or(RealtimeError::ClientDropped)
    }
}

/// A topic joined over the client's socket.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

/// Resets a subscribe that was abandoned mid-flight.
struct SubscribeGuard<'a> {
    channel: &'a RealtimeChannel,
    epoch: u64,
    armed: bool,
}

impl Drop for SubscribeGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.channel.owns_subscribe(self.epoch) {
            self.channel
                .transition(ChannelStatus::Subscribing, ChannelStatus::Unsubscribed);
        }
    }
}

async fn wait_for_status(status: &mut watch::Receiver<ChannelStatus>, target: ChannelStatus) {
    loop {
        if *status.borrow_and_update() == target {
            return;
        }
        if status.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn client_version() -> String {
    format!("realtime-rs/{}", env!("CARGO_PKG_VERSION"))
}

fn event_payload(kind: &str, event: &str, payload: Value) -> JsonObject {
    let mut body = JsonObject::new();
    body.insert("type".into(), kind.into());
    body.insert("event".into(), event.into());
    body.insert("payload".into(), payload);
    body
}

impl RealtimeChannel {
    pub(crate) fn new(topic: String, options: ChannelOptions, client: Weak<ClientInner>) -> Self {
        let (status, _) = watch::channel(ChannelStatus::Unsubscribed);
        Self {
            inner: Arc::new(ChannelInner {
                topic,
                options,
                client,
                callbacks: CallbackRegistry::new(),
                pushes: PushRegistry::new(),
                presence: Mutex::new(PresenceTracker::new()),
                status,
                join_ref: Mutex::new(None),
                subscribe_cancel: Mutex::new(None),
                subscribe_epoch: AtomicU64::new(0),
                needs_rejoin: AtomicBool::new(false),
            }),
        }
    }

    /// Full topic, including the `realtime:` prefix.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Topic without the `realtime:` prefix.
    #[must_use]
    pub fn sub_topic(&self) -> &str {
        self.inner
            .topic
            .strip_prefix(TOPIC_PREFIX)
            .unwrap_or(&self.inner.topic)
    }

    #[must_use]
    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        *self.inner.status.borrow()
    }

    /// Watch lifecycle changes.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    /// Ref of the current join, if any.
    #[must_use]
    pub fn join_ref(&self) -> Option<String> {
        self.inner.join_ref.lock().clone()
    }

    /// Merged presence state.
    #[must_use]
    pub fn presence_state(&self) -> PresenceState {
        self.inner.presence.lock().list().clone()
    }

    /// The join configuration the next attempt would send.
    #[must_use]
    pub fn join_config(&self) -> JoinConfig {
        JoinConfig {
            broadcast: self.inner.options.broadcast.clone(),
            presence: PresenceJoinConfig {
                key: self.inner.options.presence_key.clone(),
                enabled: self.inner.callbacks.has_presence_callbacks(),
            },
            postgres_changes: self.inner.callbacks.postgres_filters(),
            is_private: self.inner.options.private,
        }
    }

    pub(crate) fn same_as(&self, other: &RealtimeChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn set_status(&self, status: ChannelStatus) {
        let previous = self.inner.status.send_replace(status);
        if previous != status {
            debug!(topic = %self.inner.topic, from = %previous, to = %status, "Channel status changed");
        }
    }

    /// Move from `from` to `to`. Returns whether the channel was in `from`.
    fn transition(&self, from: ChannelStatus, to: ChannelStatus) -> bool {
        let changed = self.inner.status.send_if_modified(|status| {
            if *status == from {
                *status = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(topic = %self.inner.topic, from = %from, to = %to, "Channel status changed");
        }
        changed
    }

    // ---- Callback registration ----

    /// Listen for postgres changes matching `filter`.
    ///
    /// Filters are sent with the join, so they must be registered before
    /// the channel is subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::ContractViolation`] if the channel is already
    /// subscribed; the callback is not registered.
    pub fn on_postgres_changes<F>(&self, filter: PostgresFilter, callback: F) -> Result<Subscription>
    where
        F: Fn(&PostgresAction) + Send + Sync + 'static,
    {
        if self.status() == ChannelStatus::Subscribed {
            error!(
                topic = %self.inner.topic,
                event = %filter.event,
                "Postgres filter registered after subscribe; it cannot take effect"
            );
            let error = RealtimeError::ContractViolation(format!(
                "postgres filter added to {} after it was subscribed",
                self.inner.topic
            ));
            metrics::record_failure(&error);
            return Err(error);
        }

        let callback: PostgresCallback = Arc::new(callback);
        let id = self.inner.callbacks.add_postgres_callback(filter, callback);
        Ok(self.subscription(id))
    }

    /// Listen for JSON broadcasts of `event`, or of every event with `"*"`.
    /// The callback receives the full broadcast body `{type, event, payload}`.
    pub fn on_broadcast<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&JsonObject) + Send + Sync + 'static,
    {
        let callback: BroadcastCallback = Arc::new(callback);
        let id = self.inner.callbacks.add_broadcast_callback(event, callback);
        self.subscription(id)
    }

    /// Listen for binary broadcasts of `event`, or of every event with `"*"`.
    pub fn on_broadcast_data<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&str, &Bytes) + Send + Sync + 'static,
    {
        let callback: BroadcastDataCallback = Arc::new(callback);
        let id = self.inner.callbacks.add_broadcast_data_callback(event, callback);
        self.subscription(id)
    }

    /// Listen for presence joins and leaves. Registering one enables presence
    /// on the next join.
    pub fn on_presence<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PresenceChange) + Send + Sync + 'static,
    {
        let callback: PresenceCallback = Arc::new(callback);
        let id = self.inner.callbacks.add_presence_callback(callback);
        self.subscription(id)
    }

    /// Listen for `system` messages.
    pub fn on_system<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let callback: SystemCallback = Arc::new(callback);
        let id = self.inner.callbacks.add_system_callback(callback);
        self.subscription(id)
    }

    fn subscription(&self, id: CallbackId) -> Subscription {
        Subscription {
            channel: Arc::downgrade(&self.inner),
            id,
        }
    }

    // ---- Lifecycle ----

    /// Join the channel, retrying with backoff until the server confirms.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::MaxRetryAttemptsReached`] when every attempt
    /// failed, or [`RealtimeError::Cancelled`] when an unsubscribe or client
    /// disconnect interrupted it.
    pub async fn subscribe(&self) -> Result<()> {
        let (cancel, epoch, attempts, backoff, timeout) = {
            let client = self.inner.client()?;
            if self.status() == ChannelStatus::Subscribed {
                return Ok(());
            }
            client.ensure_channel(self);

            let cancel = client.cancel_token().child_token();
            if let Some(previous) = self.inner.subscribe_cancel.lock().replace(cancel.clone()) {
                previous.cancel();
            }
            let epoch = self.inner.subscribe_epoch.fetch_add(1, Ordering::SeqCst) + 1;

            let config = client.config();
            (
                cancel,
                epoch,
                config.max_retry_attempts.max(1),
                config.backoff(),
                config.timeout(),
            )
        };

        self.inner.needs_rejoin.store(false, Ordering::SeqCst);
        self.set_status(ChannelStatus::Subscribing);
        let mut guard = SubscribeGuard {
            channel: self,
            epoch,
            armed: true,
        };

        for attempt in 1..=attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.abort_subscribe(epoch)),
                result = tokio::time::timeout(timeout, self.join_once()) => result,
            };

            let reason = match result {
                Ok(Ok(())) => {
                    guard.armed = false;
                    return Ok(());
                }
                Ok(Err(RealtimeError::Cancelled)) => return Err(self.abort_subscribe(epoch)),
                Ok(Err(RealtimeError::ClientDropped)) => {
                    self.abort_subscribe(epoch);
                    return Err(RealtimeError::ClientDropped);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("no reply within {:?}", timeout),
            };

            if attempt == attempts {
                warn!(topic = %self.inner.topic, attempt, reason = %reason, "Join attempt failed");
                break;
            }

            let delay = backoff.delay(attempt);
            warn!(
                topic = %self.inner.topic,
                attempt,
                delay = ?delay,
                reason = %reason,
                "Join attempt failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.abort_subscribe(epoch)),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        guard.armed = false;
        if self.owns_subscribe(epoch) {
            self.transition(ChannelStatus::Subscribing, ChannelStatus::Unsubscribed);
        }
        let error = RealtimeError::MaxRetryAttemptsReached { attempts };
        metrics::record_failure(&error);
        Err(error)
    }

    fn abort_subscribe(&self, epoch: u64) -> RealtimeError {
        if self.owns_subscribe(epoch)
            && self.transition(ChannelStatus::Subscribing, ChannelStatus::Unsubscribed)
        {
            debug!(topic = %self.inner.topic, "Subscribe cancelled");
        }
        RealtimeError::Cancelled
    }

    /// A subscribe superseded by a newer one leaves the status alone.
    fn owns_subscribe(&self, epoch: u64) -> bool {
        self.inner.subscribe_epoch.load(Ordering::SeqCst) == epoch
    }

    /// One join attempt: send `phx_join` and wait for the server to confirm.
    async fn join_once(&self) -> Result<()> {
        let client = self.inner.client()?;
        if client.config().connect_on_subscribe {
            client.connect().await?;
        }
        let access_token = client.join_token().await?;
        let join_ref = client.make_ref();
        let reply_timeout = client.config().timeout();

        let payload = JoinPayload {
            config: self.join_config(),
            access_token,
            version: Some(client_version()),
        };

        *self.inner.join_ref.lock() = Some(join_ref.clone());
        self.inner.presence.lock().begin_join(join_ref.clone());

        let message = Message::new(self.inner.topic.clone(), events::JOIN, payload.to_object())
            .with_join_ref(join_ref.clone())
            .with_ref(join_ref.clone());

        let mut status = self.inner.status.subscribe();
        let waiter = self.inner.pushes.register(message.clone());
        if let Err(e) = client.push(message).await {
            self.inner.pushes.resolve(&join_ref, PushStatus::Error);
            return Err(e);
        }
        drop(client);
        debug!(topic = %self.inner.topic, join_ref = %join_ref, "Join sent");

        tokio::select! {
            _ = wait_for_status(&mut status, ChannelStatus::Subscribed) => Ok(()),
            reply = waiter.wait(reply_timeout) => match reply {
                PushStatus::Ok => Ok(()),
                PushStatus::Error => Err(RealtimeError::JoinRejected(self.inner.topic.clone())),
                PushStatus::Timeout => Err(RealtimeError::Timeout(format!("join of {}", self.inner.topic))),
            },
        }
    }

    /// Leave the channel.
    ///
    /// Cancels a subscribe in flight. Returns the status of the leave push;
    /// the channel ends Unsubscribed either way.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::ClientDropped`] if the client is gone.
    pub async fn unsubscribe(&self) -> Result<PushStatus> {
        if let Some(cancel) = self.inner.subscribe_cancel.lock().take() {
            cancel.cancel();
        }
        self.inner.needs_rejoin.store(false, Ordering::SeqCst);

        let previous = self.status();
        if previous == ChannelStatus::Unsubscribed {
            return Ok(PushStatus::Ok);
        }
        self.set_status(ChannelStatus::Unsubscribing);

        let client = self.inner.client()?;
        let join_ref = self.join_ref();
        let status = if client.is_connected() {
            let leave_ref = client.make_ref();
            let mut message = Message::new(self.inner.topic.clone(), events::LEAVE, JsonObject::new())
                .with_ref(leave_ref.clone());
            message.join_ref = join_ref;

            let waiter = self.inner.pushes.register(message.clone());
            let timeout = client.config().timeout();
            match client.push(message).await {
                Ok(()) => {
                    drop(client);
                    waiter.wait(timeout).await
                }
                Err(e) => {
                    debug!(topic = %self.inner.topic, error = %e, "Leave not sent");
                    self.inner.pushes.resolve(&leave_ref, PushStatus::Error);
                    PushStatus::Error
                }
            }
        } else {
            PushStatus::Ok
        };

        self.reset_join();
        self.set_status(ChannelStatus::Unsubscribed);
        info!(topic = %self.inner.topic, status = %status, "Left channel");
        Ok(status)
    }

    fn reset_join(&self) {
        *self.inner.join_ref.lock() = None;
        self.inner.presence.lock().clear();
        self.inner.pushes.resolve_all(PushStatus::Error);
    }

    // ---- Sending ----

    /// Broadcast a JSON payload to the topic.
    ///
    /// When the channel is not joined and acknowledgements are off, the
    /// broadcast goes over the HTTP fallback if one is configured, and
    /// otherwise reports `Ok` without sending.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::ClientDropped`] if the client is gone.
    pub async fn send_broadcast(&self, event: &str, payload: JsonObject) -> Result<PushStatus> {
        let client = self.inner.client()?;
        let ack = self.inner.options.broadcast.ack;

        if self.status() != ChannelStatus::Subscribed && !ack {
            let Some(fallback) = client.fallback() else {
                trace!(topic = %self.inner.topic, event, "Broadcast dropped while not subscribed");
                return Ok(PushStatus::Ok);
            };
            let token = client.current_token();
            drop(client);

            let message = FallbackMessage {
                topic: self.sub_topic().to_string(),
                event: event.to_string(),
                payload,
                private: self.inner.options.private,
            };
            return Ok(match fallback.broadcast(message, token.as_deref()).await {
                Ok(()) => PushStatus::Ok,
                Err(e) => {
                    let error = RealtimeError::from(e);
                    warn!(topic = %self.inner.topic, error = %error, "HTTP broadcast failed");
                    metrics::record_failure(&error);
                    PushStatus::Error
                }
            });
        }

        let body = event_payload(events::BROADCAST, event, Value::Object(payload));
        let mut message = Message::new(self.inner.topic.clone(), events::BROADCAST, body);
        message.join_ref = self.join_ref();
        self.push_message(client, message, ack).await
    }

    /// Broadcast raw bytes to the topic as a binary frame.
    ///
    /// The HTTP fallback cannot carry binary payloads, so a broadcast that
    /// would need it reports `Error`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the topic or event exceed the frame's
    /// field limits.
    pub async fn send_broadcast_data(&self, event: &str, data: Bytes) -> Result<PushStatus> {
        let client = self.inner.client()?;
        let ack = self.inner.options.broadcast.ack;

        if self.status() != ChannelStatus::Subscribed && !ack {
            if client.fallback().is_some() {
                let error = RealtimeError::from(FallbackError::Unsupported("binary payload"));
                warn!(topic = %self.inner.topic, event, error = %error, "Binary broadcast not sent");
                metrics::record_failure(&error);
                return Ok(PushStatus::Error);
            }
            return Ok(PushStatus::Ok);
        }

        let push_ref = ack.then(|| client.make_ref());
        let push = BroadcastPush::new(self.inner.topic.clone(), event, BroadcastPayload::Binary(data))
            .with_refs(self.join_ref(), push_ref.clone());
        let frame = WireFrame::Binary(encode_broadcast_push(&push)?);

        let Some(push_ref) = push_ref else {
            client.push_frame(frame).await?;
            return Ok(PushStatus::Ok);
        };

        let mut message = Message::new(self.inner.topic.clone(), events::BROADCAST, JsonObject::new())
            .with_ref(push_ref.clone());
        message.join_ref = push.join_ref.clone();
        let waiter = self.inner.pushes.register(message);
        let timeout = client.config().timeout();
        if let Err(e) = client.push_frame(frame).await {
            debug!(topic = %self.inner.topic, error = %e, "Binary broadcast not sent");
            self.inner.pushes.resolve(&push_ref, PushStatus::Error);
            return Ok(PushStatus::Error);
        }
        drop(client);
        Ok(waiter.wait(timeout).await)
    }

    /// Track this client's presence state.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::ClientDropped`] if the client is gone.
    pub async fn track(&self, state: JsonObject) -> Result<PushStatus> {
        self.send_presence("track", Value::Object(state)).await
    }

    /// Stop tracking this client's presence.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::ClientDropped`] if the client is gone.
    pub async fn untrack(&self) -> Result<PushStatus> {
        self.send_presence("untrack", Value::Object(JsonObject::new())).await
    }

    async fn send_presence(&self, event: &str, payload: Value) -> Result<PushStatus> {
        let client = self.inner.client()?;
        if self.status() != ChannelStatus::Subscribed {
            warn!(topic = %self.inner.topic, event, "Presence update on a channel that is not subscribed");
            return Ok(PushStatus::Error);
        }

        let body = event_payload(events::PRESENCE, event, payload);
        let mut message = Message::new(self.inner.topic.clone(), events::PRESENCE, body);
        message.join_ref = self.join_ref();
        self.push_message(client, message, true).await
    }

    async fn push_message(
        &self,
        client: Arc<ClientInner>,
        message: Message,
        ack: bool,
    ) -> Result<PushStatus> {
        if !ack {
            client.push(message).await?;
            return Ok(PushStatus::Ok);
        }

        let push_ref = client.make_ref();
        let message = message.with_ref(push_ref.clone());
        let waiter = self.inner.pushes.register(message.clone());
        let timeout = client.config().timeout();
        if let Err(e) = client.push(message).await {
            debug!(topic = %self.inner.topic, error = %e, "Push not sent");
            self.inner.pushes.resolve(&push_ref, PushStatus::Error);
            return Ok(PushStatus::Error);
        }
        drop(client);
        Ok(waiter.wait(timeout).await)
    }

    // ---- Inbound ----

    /// Router entry point.
    pub(crate) fn on_frame(&self, frame: &Frame) {
        match frame {
            Frame::Message(message) => self.on_message(message),
            Frame::Broadcast(broadcast) => match &broadcast.payload {
                BroadcastPayload::Binary(data) => {
                    self.inner.callbacks.trigger_broadcast_data(&broadcast.event, data);
                }
                BroadcastPayload::Json(payload) => {
                    let body = event_payload(
                        events::BROADCAST,
                        &broadcast.event,
                        Value::Object(payload.clone()),
                    );
                    self.inner.callbacks.trigger_broadcast(&broadcast.event, &body);
                }
            },
        }
    }

    /// Interpret one inbound message for this topic.
    pub fn on_message(&self, message: &Message) {
        let event = message.event.as_str();

        if matches!(event, events::REPLY | events::CLOSE | events::ERROR) && self.is_stale(message) {
            trace!(topic = %self.inner.topic, event, "Dropping message from a previous join");
            return;
        }

        match event {
            events::SYSTEM => {
                if message.status() == Some("ok") {
                    self.mark_subscribed();
                }
                self.inner.callbacks.trigger_system(message);
            }
            events::REPLY => self.on_reply(message),
            events::POSTGRES_CHANGES => match decode_change(message) {
                Ok(change) => self
                    .inner
                    .callbacks
                    .trigger_postgres_changes(&change.ids, &change.action),
                Err(e) => {
                    warn!(topic = %self.inner.topic, error = %e, "Dropping undecodable postgres change");
                    metrics::record_error("protocol");
                }
            },
            events::BROADCAST => {
                let name = message
                    .payload
                    .get("event")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.inner.callbacks.trigger_broadcast(name, &message.payload);
            }
            events::CLOSE => {
                info!(topic = %self.inner.topic, "Channel closed by server");
                if let Some(cancel) = self.inner.subscribe_cancel.lock().take() {
                    cancel.cancel();
                }
                self.reset_join();
                self.set_status(ChannelStatus::Unsubscribed);
                if let Some(client) = self.inner.client.upgrade() {
                    client.forget_channel(self);
                }
            }
            events::ERROR => {
                warn!(topic = %self.inner.topic, payload = ?message.payload, "Channel error");
                metrics::record_error("channel");
            }
            events::PRESENCE_STATE => {
                let snapshot = decode_state(&message.payload);
                self.inner.presence.lock().apply_state(&snapshot);
                self.inner.callbacks.trigger_presence_diffs(
                    snapshot,
                    PresenceState::new(),
                    message.clone(),
                );
            }
            events::PRESENCE_DIFF => {
                let diff = decode_diff(&message.payload);
                self.inner.presence.lock().apply_diff(diff.clone());
                self.inner
                    .callbacks
                    .trigger_presence_diffs(diff.joins, diff.leaves, message.clone());
            }
            other => trace!(topic = %self.inner.topic, event = other, "Unhandled event"),
        }
    }

    fn is_stale(&self, message: &Message) -> bool {
        match (&message.join_ref, &*self.inner.join_ref.lock()) {
            (Some(received), Some(current)) => received != current,
            _ => false,
        }
    }

    fn on_reply(&self, message: &Message) {
        let Some(msg_ref) = message.msg_ref.as_deref() else {
            return;
        };
        let status = PushStatus::from_reply(message.status().unwrap_or("error"));
        let is_join = self.inner.join_ref.lock().as_deref() == Some(msg_ref);

        if is_join {
            match status {
                PushStatus::Ok => {
                    let confirmed = message
                        .response()
                        .and_then(|response| response.get("postgres_changes"))
                        .cloned();
                    if let Some(confirmed) = confirmed {
                        match serde_json::from_value::<Vec<PostgresFilter>>(confirmed) {
                            Ok(filters) => self.inner.callbacks.set_server_changes(filters),
                            Err(e) => {
                                warn!(topic = %self.inner.topic, error = %e, "Invalid postgres_changes in join reply");
                            }
                        }
                    }
                    self.mark_subscribed();
                }
                _ => {
                    warn!(topic = %self.inner.topic, response = ?message.response(), "Join rejected");
                }
            }
        }

        self.inner.pushes.resolve(msg_ref, status);
    }

    fn mark_subscribed(&self) {
        if self.transition(ChannelStatus::Subscribing, ChannelStatus::Subscribed) {
            info!(topic = %self.inner.topic, "Subscribed");
            metrics::record_channel_join();
        }
    }

    // ---- Connection lifecycle, driven by the client ----

    /// The socket went away. A joined channel rejoins after the next connect.
    pub(crate) fn on_connection_lost(&self, reconnecting: bool) {
        let was_joined = self.status() == ChannelStatus::Subscribed;
        if was_joined {
            self.inner.needs_rejoin.store(true, Ordering::SeqCst);
            let next = if reconnecting {
                ChannelStatus::Subscribing
            } else {
                ChannelStatus::Unsubscribed
            };
            self.transition(ChannelStatus::Subscribed, next);
        }
    }

    /// Take the rejoin flag set by [`Self::on_connection_lost`].
    pub(crate) fn take_rejoin(&self) -> bool {
        self.inner.needs_rejoin.swap(false, Ordering::SeqCst)
    }

    /// Tell the server about a new access token.
    pub(crate) fn access_token_message(&self, token: &str) -> Option<Message> {
        if self.status() != ChannelStatus::Subscribed {
            return None;
        }
        let mut payload = JsonObject::new();
        payload.insert("access_token".into(), token.into());
        let mut message = Message::new(self.inner.topic.clone(), events::ACCESS_TOKEN, payload);
        message.join_ref = self.join_ref();
        Some(message)
    }

    #[cfg(test)]
    pub(crate) fn callbacks(&self) -> &CallbackRegistry {
        &self.inner.callbacks
    }
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("topic", &self.inner.topic)
            .field("status", &self.status())
            .finish()
    }
}
