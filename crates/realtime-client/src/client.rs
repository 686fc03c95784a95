//! The realtime client.
//!
//! One client owns one socket. It buffers pushes while disconnected,
//! keeps the socket alive with heartbeats, routes inbound frames to
//! channels by topic and rejoins channels after a reconnect.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use realtime_core::{
    HeartbeatHandler, HeartbeatMonitor, HeartbeatStatus, MessageRouter, PushStatus, RefGenerator,
};
use realtime_protocol::{
    decode_binary, decode_text, encode_text, events, Frame, Message, PHOENIX_TOPIC,
    PROTOCOL_VERSION,
};
use realtime_transport::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionStatus, TransportError,
    TransportFactory, WireFrame, CLOSE_NORMAL,
};

use crate::auth::{check_expiry, AccessTokenProvider};
use crate::channel::{normalize_topic, ChannelOptions, RealtimeChannel};
use crate::config::ClientConfig;
use crate::error::{RealtimeError, Result};
use crate::metrics;
use crate::rest::{BroadcastFallback, HttpBroadcastFallback};

type MessageObserver = Arc<dyn Fn(&Frame) + Send + Sync + 'static>;
type HeartbeatObserver = Arc<dyn Fn(HeartbeatStatus) + Send + Sync + 'static>;

/// Build the socket URL: `<url>/websocket?apikey=<key>&vsn=2.0.0`.
///
/// # Errors
///
/// Returns an error if `url` does not parse.
pub fn endpoint_url(url: &str, api_key: &str) -> Result<String> {
    let mut endpoint = Url::parse(url)?;

    let path = endpoint.path().trim_end_matches('/').to_string();
    if !path.ends_with("/websocket") {
        endpoint.set_path(&format!("{}/websocket", path));
    }

    let has = |name: &str| endpoint.query_pairs().any(|(key, _)| key == name);
    let (has_key, has_vsn) = (has("apikey"), has("vsn"));
    {
        let mut query = endpoint.query_pairs_mut();
        if !api_key.is_empty() && !has_key {
            query.append_pair("apikey", api_key);
        }
        if !has_vsn {
            query.append_pair("vsn", &PROTOCOL_VERSION.to_string());
        }
    }

    Ok(endpoint.to_string())
}

/// Configures and builds a [`RealtimeClient`].
pub struct RealtimeClientBuilder {
    url: String,
    config: ClientConfig,
    transport: Option<Arc<dyn TransportFactory>>,
    token_provider: Option<Arc<dyn AccessTokenProvider>>,
    fallback: Option<Option<Arc<dyn BroadcastFallback>>>,
}

impl RealtimeClientBuilder {
    /// Use a specific transport instead of the default WebSocket one.
    #[must_use]
    pub fn transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport = Some(factory);
        self
    }

    /// Ask `provider` for the access token before every join.
    #[must_use]
    pub fn token_provider(mut self, provider: Arc<dyn AccessTokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Deliver broadcasts of unjoined channels through `fallback`.
    #[must_use]
    pub fn fallback(mut self, fallback: Arc<dyn BroadcastFallback>) -> Self {
        self.fallback = Some(Some(fallback));
        self
    }

    /// Drop broadcasts of unjoined channels instead of sending them over HTTP.
    #[must_use]
    pub fn without_fallback(mut self) -> Self {
        self.fallback = Some(None);
        self
    }

    /// Build the client. It does not connect until asked to.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or no transport is available.
    pub fn build(self) -> Result<RealtimeClient> {
        let endpoint = endpoint_url(&self.url, &self.config.api_key)?;

        let transport = match self.transport {
            Some(factory) => factory,
            None => default_transport()?,
        };
        let fallback = match self.fallback {
            Some(fallback) => fallback,
            None => {
                let http = HttpBroadcastFallback::new(&self.url, self.config.api_key.clone())?;
                Some(Arc::new(http) as Arc<dyn BroadcastFallback>)
            }
        };

        let mut headers = self.config.headers.clone();
        if !self.config.api_key.is_empty() {
            headers
                .entry("apikey".to_string())
                .or_insert_with(|| self.config.api_key.clone());
        }
        let connection_config = ConnectionConfig {
            url: endpoint.clone(),
            headers,
            reconnect_delay: self.config.reconnect_delay(),
        };
        let (connection, events) = ConnectionManager::new(connection_config, transport);

        let config = self.config;
        let token_provider = self.token_provider;
        let shutdown = CancellationToken::new();
        let inner = Arc::new_cyclic(|this: &Weak<ClientInner>| {
            let handler = Arc::new(ClientHeartbeat {
                client: this.clone(),
            });
            ClientInner {
                this: this.clone(),
                endpoint,
                heartbeat: HeartbeatMonitor::new(config.heartbeat_interval(), handler),
                config,
                connection,
                router: MessageRouter::new(),
                channels: DashMap::new(),
                refs: RefGenerator::new(),
                send_buffer: Mutex::new(VecDeque::new()),
                send_lock: tokio::sync::Mutex::new(()),
                access_token: RwLock::new(None),
                had_token: AtomicBool::new(false),
                token_provider,
                fallback,
                heartbeat_observers: RwLock::new(Vec::new()),
                cancel: Mutex::new(shutdown.child_token()),
                shutdown: shutdown.clone(),
            }
        });

        metrics::describe_metrics();
        spawn_event_loop(Arc::downgrade(&inner), events, shutdown);
        debug!(endpoint = %inner.endpoint, "Realtime client created");

        Ok(RealtimeClient { inner })
    }
}

#[cfg(feature = "websocket")]
fn default_transport() -> Result<Arc<dyn TransportFactory>> {
    Ok(Arc::new(realtime_transport::WebSocketFactory::new()))
}

#[cfg(not(feature = "websocket"))]
fn default_transport() -> Result<Arc<dyn TransportFactory>> {
    Err(TransportError::Other("no transport configured".into()).into())
}

/// Client for realtime channels over a single socket.
///
/// Cloning yields another handle to the same client. Background tasks stop
/// once the last handle is dropped.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl RealtimeClient {
    /// Start building a client for `url`, e.g.
    /// `wss://<project>.example.co/realtime/v1`.
    #[must_use]
    pub fn builder(url: impl Into<String>, config: ClientConfig) -> RealtimeClientBuilder {
        RealtimeClientBuilder {
            url: url.into(),
            config,
            transport: None,
            token_provider: None,
            fallback: None,
        }
    }

    /// Build a client with default transport and fallback.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn new(url: impl Into<String>, config: ClientConfig) -> Result<Self> {
        Self::builder(url, config).build()
    }

    /// Socket URL, including query parameters.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Connect, or wait for the connect already in flight.
    ///
    /// # Errors
    ///
    /// Returns the transport error of a failed attempt.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Close the socket and cancel pending subscribes.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.connection.subscribe_status()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Get the channel for `topic`, creating it if needed.
    ///
    /// The `realtime:` prefix is added when missing. `options` only apply
    /// when the channel is created.
    #[must_use]
    pub fn channel(&self, topic: &str, options: ChannelOptions) -> RealtimeChannel {
        self.inner.channel(topic, options)
    }

    /// Every registered channel.
    #[must_use]
    pub fn channels(&self) -> Vec<RealtimeChannel> {
        self.inner
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Unsubscribe and forget a channel. Disconnects once no channels remain.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::ClientDropped`] if the channel belongs to a
    /// client that is gone.
    pub async fn remove_channel(&self, channel: &RealtimeChannel) -> Result<PushStatus> {
        let status = channel.unsubscribe().await?;
        self.inner.forget_channel(channel);
        if self.inner.channels.is_empty() {
            self.inner.disconnect().await;
        }
        Ok(status)
    }

    /// Unsubscribe and forget every channel, then disconnect.
    ///
    /// # Errors
    ///
    /// Returns the first unsubscribe error.
    pub async fn remove_all_channels(&self) -> Result<Vec<PushStatus>> {
        let mut statuses = Vec::new();
        for channel in self.channels() {
            statuses.push(channel.unsubscribe().await?);
            self.inner.forget_channel(&channel);
        }
        self.inner.disconnect().await;
        Ok(statuses)
    }

    /// Set the access token and send it to every joined channel.
    ///
    /// `None` clears the token.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidToken`] for an expired token, which is
    /// not stored.
    pub async fn set_auth(&self, token: Option<String>) -> Result<()> {
        self.inner.set_auth(token).await
    }

    /// Current access token.
    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.inner.current_token()
    }

    /// Send a message, buffering it while disconnected.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded or the socket
    /// fails to send it.
    pub async fn push(&self, message: Message) -> Result<()> {
        self.inner.push(message).await
    }

    /// Allocate the next message ref.
    #[must_use]
    pub fn make_ref(&self) -> String {
        self.inner.make_ref()
    }

    /// Observe every inbound frame before it reaches its channel.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let observer: MessageObserver = Arc::new(callback);
        self.inner.router.add_system_handler(observer);
    }

    /// Observe heartbeat sends, acknowledgements and timeouts.
    pub fn on_heartbeat<F>(&self, callback: F)
    where
        F: Fn(HeartbeatStatus) + Send + Sync + 'static,
    {
        self.inner.heartbeat_observers.write().push(Arc::new(callback));
    }

    /// Number of frames waiting for a connection.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner.send_buffer.lock().len()
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("endpoint", &self.inner.endpoint)
            .field("status", &self.status())
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}

pub(crate) struct ClientInner {
    this: Weak<ClientInner>,
    endpoint: String,
    config: ClientConfig,
    connection: ConnectionManager,
    heartbeat: HeartbeatMonitor,
    router: MessageRouter,
    channels: DashMap<String, RealtimeChannel>,
    refs: RefGenerator,
    send_buffer: Mutex<VecDeque<WireFrame>>,
    /// Serializes socket writes so buffered frames go out first.
    send_lock: tokio::sync::Mutex<()>,
    access_token: RwLock<Option<String>>,
    had_token: AtomicBool,
    token_provider: Option<Arc<dyn AccessTokenProvider>>,
    fallback: Option<Arc<dyn BroadcastFallback>>,
    heartbeat_observers: RwLock<Vec<HeartbeatObserver>>,
    /// Cancels subscribes in flight; replaced on every disconnect.
    cancel: Mutex<CancellationToken>,
    shutdown: CancellationToken,
}

impl ClientInner {
    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn fallback(&self) -> Option<Arc<dyn BroadcastFallback>> {
        self.fallback.clone()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    pub(crate) fn make_ref(&self) -> String {
        self.refs.next_ref()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub(crate) fn current_token(&self) -> Option<String> {
        self.access_token.read().clone()
    }

    pub(crate) async fn connect(&self) -> Result<()> {
        self.connection.connect().await?;
        Ok(())
    }

    pub(crate) async fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.cancel.lock(), self.shutdown.child_token());
        previous.cancel();
        self.heartbeat.stop();
        self.connection.disconnect(CLOSE_NORMAL, "client disconnect").await;

        let dropped = std::mem::take(&mut *self.send_buffer.lock()).len();
        if dropped > 0 {
            debug!(dropped, "Discarded buffered frames on disconnect");
        }
    }

    fn channel(&self, topic: &str, options: ChannelOptions) -> RealtimeChannel {
        let topic = normalize_topic(topic);
        let mut created = false;
        let channel = self
            .channels
            .entry(topic.clone())
            .or_insert_with(|| {
                created = true;
                RealtimeChannel::new(topic.clone(), options, self.this.clone())
            })
            .clone();
        if created || !self.router.has_channel(&topic) {
            debug!(topic = %topic, "Channel registered");
            self.register_route(&channel);
        }
        channel
    }

    /// Make sure `channel` is registered and routed. A channel that was
    /// forgotten after a close is registered again.
    pub(crate) fn ensure_channel(&self, channel: &RealtimeChannel) {
        let topic = channel.topic().to_string();
        let current = self
            .channels
            .get(&topic)
            .is_some_and(|existing| existing.same_as(channel));
        if !current {
            self.channels.insert(topic.clone(), channel.clone());
        }
        if !current || !self.router.has_channel(&topic) {
            self.register_route(channel);
        }
    }

    fn register_route(&self, channel: &RealtimeChannel) {
        let target = channel.clone();
        self.router
            .register_channel(channel.topic(), Arc::new(move |frame: &Frame| target.on_frame(frame)));
    }

    pub(crate) fn forget_channel(&self, channel: &RealtimeChannel) {
        let removed = self
            .channels
            .remove_if(channel.topic(), |_, current| current.same_as(channel))
            .is_some();
        if removed {
            self.router.unregister_channel(channel.topic());
            debug!(topic = %channel.topic(), "Channel removed");
        }
    }

    /// Resolve the token for the next join.
    ///
    /// Returns [`RealtimeError::Cancelled`] after disconnecting when the
    /// session was lost and `disconnect_on_session_loss` is set.
    pub(crate) async fn join_token(&self) -> Result<Option<String>> {
        let Some(provider) = self.token_provider.clone() else {
            return Ok(self.current_token());
        };

        match provider.access_token().await {
            Some(token) => {
                if let Err(e) = check_expiry(&token) {
                    warn!(error = %e, "Token provider returned an expired token; keeping the current one");
                    return Ok(self.current_token());
                }
                *self.access_token.write() = Some(token.clone());
                self.had_token.store(true, Ordering::SeqCst);
                Ok(Some(token))
            }
            None if self.had_token.load(Ordering::SeqCst) => {
                *self.access_token.write() = None;
                if self.config.disconnect_on_session_loss {
                    warn!("Session lost, disconnecting");
                    self.disconnect().await;
                    return Err(RealtimeError::Cancelled);
                }
                info!("Session lost, joining without a token");
                Ok(None)
            }
            None => Ok(self.current_token()),
        }
    }

    async fn set_auth(&self, token: Option<String>) -> Result<()> {
        if let Some(token) = &token {
            if let Err(e) = check_expiry(token) {
                warn!(error = %e, "Rejected access token");
                return Err(e);
            }
            self.had_token.store(true, Ordering::SeqCst);
        }
        *self.access_token.write() = token.clone();

        let Some(token) = token else {
            return Ok(());
        };
        let messages: Vec<Message> = self
            .channels
            .iter()
            .filter_map(|entry| entry.value().access_token_message(&token))
            .collect();
        for message in messages {
            debug!(topic = %message.topic, "Sending access token");
            self.push(message).await?;
        }
        Ok(())
    }

    pub(crate) async fn push(&self, message: Message) -> Result<()> {
        let text = encode_text(&message)?;
        trace!(topic = %message.topic, event = %message.event, "Push");
        self.push_frame(WireFrame::Text(text)).await
    }

    /// Send a frame now, or queue it until the next connect.
    pub(crate) async fn push_frame(&self, frame: WireFrame) -> Result<()> {
        let _send = self.send_lock.lock().await;
        {
            let mut buffer = self.send_buffer.lock();
            if !self.connection.is_connected() || !buffer.is_empty() {
                trace!(queued = buffer.len() + 1, "Buffering frame until connected");
                buffer.push_back(frame);
                return Ok(());
            }
        }

        match self.connection.send(frame.clone()).await {
            Ok(()) => {
                metrics::record_message("outbound");
                Ok(())
            }
            Err(TransportError::NotConnected) => {
                self.send_buffer.lock().push_back(frame);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send buffered frames in order. Stops at the first failure, keeping
    /// that frame at the front.
    async fn flush_send_buffer(&self) {
        let _send = self.send_lock.lock().await;
        let mut sent = 0usize;
        loop {
            let next = self.send_buffer.lock().pop_front();
            let Some(frame) = next else {
                break;
            };
            if let Err(e) = self.connection.send(frame.clone()).await {
                debug!(error = %e, "Flush interrupted");
                self.send_buffer.lock().push_front(frame);
                break;
            }
            metrics::record_message("outbound");
            sent += 1;
        }
        if sent > 0 {
            debug!(sent, "Flushed send buffer");
        }
    }

    async fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                info!(endpoint = %self.endpoint, "Socket open");
                metrics::record_connected();
                self.heartbeat.start();
                self.flush_send_buffer().await;
                self.rejoin_channels();
            }
            ConnectionEvent::Text(text) => {
                metrics::record_message("inbound");
                match decode_text(&text) {
                    Ok(message) => {
                        if message.topic == PHOENIX_TOPIC && message.event == events::REPLY {
                            if let Some(heartbeat_ref) = message.msg_ref.as_deref() {
                                self.heartbeat.on_heartbeat_response(heartbeat_ref);
                            }
                        }
                        self.router.route(&Frame::from(message));
                    }
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable text frame");
                        metrics::record_error("protocol");
                    }
                }
            }
            ConnectionEvent::Binary(data) => {
                metrics::record_message("inbound");
                match decode_binary(&data) {
                    Ok(frame) => self.router.route(&frame),
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable binary frame");
                        metrics::record_error("protocol");
                    }
                }
            }
            ConnectionEvent::Reconnecting { reason } => {
                warn!(reason = %reason, "Socket lost, reconnecting");
                self.heartbeat.stop();
                metrics::record_reconnect();
                self.connection_lost(true);
            }
            ConnectionEvent::Disconnected { reason } => {
                info!(reason = %reason, "Socket closed");
                self.heartbeat.stop();
                metrics::record_disconnected();
                self.connection_lost(false);
            }
        }
    }

    fn connection_lost(&self, reconnecting: bool) {
        for entry in self.channels.iter() {
            entry.value().on_connection_lost(reconnecting);
        }
    }

    fn rejoin_channels(&self) {
        let channels: Vec<RealtimeChannel> = self
            .channels
            .iter()
            .filter(|entry| entry.value().take_rejoin())
            .map(|entry| entry.value().clone())
            .collect();

        for channel in channels {
            debug!(topic = %channel.topic(), "Rejoining channel");
            tokio::spawn(async move {
                if let Err(e) = channel.subscribe().await {
                    warn!(topic = %channel.topic(), error = %e, "Rejoin failed");
                }
            });
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.lock().cancel();
        self.shutdown.cancel();
    }
}

fn spawn_event_loop(
    client: Weak<ClientInner>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(client) = client.upgrade() else {
                break;
            };
            client.handle_event(event).await;
        }
        trace!("Client event loop stopped");
    });
}

/// Heartbeats go straight to the socket, never through the send buffer.
struct ClientHeartbeat {
    client: Weak<ClientInner>,
}

#[async_trait]
impl HeartbeatHandler for ClientHeartbeat {
    fn next_ref(&self) -> String {
        self.client
            .upgrade()
            .map(|client| client.make_ref())
            .unwrap_or_default()
    }

    async fn send_heartbeat(&self, heartbeat_ref: String) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let text = match encode_text(&Message::heartbeat(heartbeat_ref)) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode heartbeat");
                return;
            }
        };
        match client.connection.send(WireFrame::Text(text)).await {
            Ok(()) => metrics::record_message("outbound"),
            Err(e) => debug!(error = %e, "Heartbeat not sent"),
        }
    }

    fn on_timeout(&self) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        warn!("Heartbeat timed out");
        metrics::record_heartbeat_timeout();
        client.connection.handle_error(TransportError::HeartbeatTimeout);
    }

    fn on_status(&self, status: HeartbeatStatus) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let observers = client.heartbeat_observers.read().clone();
        for observer in observers {
            observer(status);
        }
    }
}
