//! Connection state machine.
//!
//! Owns the single transport of a client. Connect attempts run as their own
//! tasks so that any number of callers can await the same attempt, and a
//! disconnect can cancel one mid-flight by dropping the factory future.
//!
//! ```text
//!                 connect()                 attempt ok
//! Disconnected ──────────────▶ Connecting ─────────────▶ Connected
//!      ▲                          │                         │
//!      │ disconnect() / failure   │                         │ handle_error()
//!      └──────────────────────────┘                         ▼
//!      ▲                                              Reconnecting
//!      └───────────────── disconnect() ──────────────────────┘
//! ```

use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::traits::{Transport, TransportError, TransportEvent, TransportFactory, WireFrame, CLOSE_NORMAL};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events delivered to the owner of the connection, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A transport was established.
    Connected,
    /// A text frame arrived.
    Text(String),
    /// A binary frame arrived.
    Binary(bytes::Bytes),
    /// The connection was lost and a new attempt is scheduled.
    Reconnecting { reason: String },
    /// The connection was shut down.
    Disconnected { reason: String },
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Endpoint URL.
    pub url: String,
    /// Headers sent with every connect.
    pub headers: HashMap<String, String>,
    /// Delay before reconnecting after a connection error.
    pub reconnect_delay: Duration,
}

impl ConnectionConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            reconnect_delay: Duration::from_secs(7),
        }
    }
}

#[derive(Debug, Clone)]
enum AttemptStatus {
    Pending,
    Succeeded,
    Failed(String),
    Cancelled,
}

/// An in-flight connect attempt.
struct Attempt {
    id: u64,
    token: CancellationToken,
    status: watch::Receiver<AttemptStatus>,
}

enum State {
    Disconnected,
    Connecting(Attempt),
    Connected {
        id: u64,
        transport: Arc<dyn Transport>,
        epoch: CancellationToken,
    },
    Reconnecting {
        attempt: Attempt,
        reason: String,
    },
}

impl State {
    fn status(&self) -> ConnectionStatus {
        match self {
            State::Disconnected => ConnectionStatus::Disconnected,
            State::Connecting(_) => ConnectionStatus::Connecting,
            State::Connected { .. } => ConnectionStatus::Connected,
            State::Reconnecting { .. } => ConnectionStatus::Reconnecting,
        }
    }

    fn attempt_id(&self) -> Option<u64> {
        match self {
            State::Connecting(attempt) | State::Reconnecting { attempt, .. } => Some(attempt.id),
            _ => None,
        }
    }
}

struct Inner {
    config: ConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<State>,
    status: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    next_id: AtomicU64,
}

/// Drives the lifecycle of one logical connection.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a disconnected manager and the receiver for its events.
    #[must_use]
    pub fn new(
        config: ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let inner = Arc::new(Inner {
            config,
            factory,
            state: Mutex::new(State::Disconnected),
            status,
            events,
            next_id: AtomicU64::new(0),
        });
        (Self { inner }, receiver)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status()
    }

    /// Watch status changes.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Check whether a transport is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Connect, or join the attempt already in flight.
    ///
    /// # Errors
    ///
    /// Returns the attempt's failure, or [`TransportError::Cancelled`] if a
    /// disconnect cancelled it.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let status = {
            let mut state = self.inner.state.lock();
            match &*state {
                State::Connected { .. } => return Ok(()),
                State::Connecting(attempt) | State::Reconnecting { attempt, .. } => {
                    attempt.status.clone()
                }
                State::Disconnected => {
                    let attempt = self.inner.start_attempt(Duration::ZERO);
                    let status = attempt.status.clone();
                    *state = State::Connecting(attempt);
                    self.inner.publish(ConnectionStatus::Connecting);
                    status
                }
            }
        };

        wait_for(status).await
    }

    /// Shut the connection down, cancelling any attempt in flight.
    pub async fn disconnect(&self, code: u16, reason: &str) {
        self.inner.disconnect(code, reason).await;
    }

    /// React to a transport failure by scheduling a reconnect.
    ///
    /// Ignored unless connected, and for cancellations.
    pub fn handle_error(&self, error: TransportError) {
        self.inner.handle_error(None, error);
    }

    /// React to the socket being closed.
    pub async fn handle_close(&self, code: u16, reason: &str) {
        self.inner.disconnect(code, reason).await;
    }

    /// Send a frame over the established transport.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] when no transport is
    /// established, or the transport's send error.
    pub async fn send(&self, frame: WireFrame) -> Result<(), TransportError> {
        let transport = match &*self.inner.state.lock() {
            State::Connected { transport, .. } => Arc::clone(transport),
            _ => return Err(TransportError::NotConnected),
        };
        transport.send(frame).await
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.config.url)
            .field("status", &self.status())
            .finish()
    }
}

async fn wait_for(mut status: watch::Receiver<AttemptStatus>) -> Result<(), TransportError> {
    loop {
        let current = status.borrow_and_update().clone();
        match current {
            AttemptStatus::Pending => {}
            AttemptStatus::Succeeded => return Ok(()),
            AttemptStatus::Failed(reason) => return Err(TransportError::ConnectFailed(reason)),
            AttemptStatus::Cancelled => return Err(TransportError::Cancelled),
        }
        if status.changed().await.is_err() {
            return Err(TransportError::Cancelled);
        }
    }
}

impl Inner {
    fn publish(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    fn emit(&self, event: ConnectionEvent) {
        // Nobody listening means the owner is gone; nothing to do.
        let _ = self.events.send(event);
    }

    fn start_attempt(self: &Arc<Self>, delay: Duration) -> Attempt {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let (status_tx, status) = watch::channel(AttemptStatus::Pending);

        let inner = Arc::clone(self);
        let cancelled = token.clone();
        tokio::spawn(async move {
            debug!(attempt = id, delay = ?delay, "Starting connect attempt");
            let result = tokio::select! {
                _ = cancelled.cancelled() => None,
                result = async {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    inner.factory.connect(&inner.config.url, &inner.config.headers).await
                } => Some(result),
            };

            let orphan = inner.finish_attempt(id, result, &status_tx);
            if let Some(transport) = orphan {
                debug!(attempt = id, "Closing transport of cancelled attempt");
                if let Err(e) = transport.close(CLOSE_NORMAL, "cancelled").await {
                    debug!(error = %e, "Failed to close orphaned transport");
                }
            }
        });

        Attempt { id, token, status }
    }

    /// Apply the outcome of an attempt. Returns a transport that must be
    /// closed because its attempt was superseded.
    fn finish_attempt(
        self: &Arc<Self>,
        id: u64,
        result: Option<Result<Arc<dyn Transport>, TransportError>>,
        status_tx: &watch::Sender<AttemptStatus>,
    ) -> Option<Arc<dyn Transport>> {
        let mut state = self.state.lock();
        let current = state.attempt_id() == Some(id);

        match result {
            None => {
                status_tx.send_replace(AttemptStatus::Cancelled);
                None
            }
            Some(Ok(transport)) if current => {
                let epoch = CancellationToken::new();
                *state = State::Connected {
                    id,
                    transport: Arc::clone(&transport),
                    epoch: epoch.clone(),
                };
                // Published under the lock so a racing disconnect is always last.
                self.publish(ConnectionStatus::Connected);
                self.emit(ConnectionEvent::Connected);
                drop(state);

                info!(url = %self.config.url, transport = transport.name(), "Connected");
                self.spawn_pump(id, transport, epoch);
                status_tx.send_replace(AttemptStatus::Succeeded);
                None
            }
            Some(Ok(transport)) => {
                status_tx.send_replace(AttemptStatus::Cancelled);
                Some(transport)
            }
            Some(Err(error)) if current => {
                let reason = error.to_string();
                if matches!(&*state, State::Reconnecting { .. }) {
                    warn!(error = %reason, "Reconnect attempt failed");
                    let attempt = self.start_attempt(self.config.reconnect_delay);
                    *state = State::Reconnecting {
                        attempt,
                        reason: reason.clone(),
                    };
                } else {
                    warn!(error = %reason, "Connect failed");
                    *state = State::Disconnected;
                    self.publish(ConnectionStatus::Disconnected);
                    drop(state);
                }
                status_tx.send_replace(AttemptStatus::Failed(reason));
                None
            }
            Some(Err(_)) => {
                status_tx.send_replace(AttemptStatus::Cancelled);
                None
            }
        }
    }

    fn spawn_pump(self: &Arc<Self>, id: u64, transport: Arc<dyn Transport>, epoch: CancellationToken) {
        let Some(mut events) = transport.events() else {
            warn!("Transport event stream already taken");
            self.handle_error(Some(id), TransportError::ReceiveFailed("no event stream".into()));
            return;
        };
        let weak: Weak<Inner> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = epoch.cancelled() => return,
                    next = events.next() => next,
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };

                match next {
                    Some(Ok(TransportEvent::Text(text))) => {
                        trace!(len = text.len(), "Received text frame");
                        inner.emit(ConnectionEvent::Text(text));
                    }
                    Some(Ok(TransportEvent::Binary(data))) => {
                        trace!(len = data.len(), "Received binary frame");
                        inner.emit(ConnectionEvent::Binary(data));
                    }
                    Some(Ok(TransportEvent::Close { code, reason })) => {
                        info!(code, reason = %reason, "Server closed connection");
                        if inner.is_current(id) {
                            inner.disconnect(code, &reason).await;
                        }
                        return;
                    }
                    Some(Err(error)) => {
                        inner.handle_error(Some(id), error);
                        return;
                    }
                    None => {
                        inner.handle_error(Some(id), TransportError::ConnectionClosed);
                        return;
                    }
                }
            }
        });
    }

    fn is_current(&self, id: u64) -> bool {
        matches!(&*self.state.lock(), State::Connected { id: current, .. } if *current == id)
    }

    /// Reconnect after an error on connection `id`, or on whatever
    /// connection is established when `id` is `None`.
    fn handle_error(self: &Arc<Self>, id: Option<u64>, error: TransportError) {
        if error.is_cancellation() {
            return;
        }

        let reason = error.to_string();
        let dead = {
            let mut state = self.state.lock();
            let (current, transport, epoch) = match &*state {
                State::Connected {
                    id: current,
                    transport,
                    epoch,
                } => (*current, Arc::clone(transport), epoch.clone()),
                other => {
                    debug!(status = %other.status(), error = %reason, "Ignoring error while not connected");
                    return;
                }
            };
            if id.is_some_and(|id| id != current) {
                debug!(error = %reason, "Ignoring error from stale connection");
                return;
            }

            epoch.cancel();
            let attempt = self.start_attempt(self.config.reconnect_delay);
            *state = State::Reconnecting {
                attempt,
                reason: reason.clone(),
            };
            self.publish(ConnectionStatus::Reconnecting);
            self.emit(ConnectionEvent::Reconnecting {
                reason: reason.clone(),
            });
            transport
        };

        warn!(error = %reason, delay = ?self.config.reconnect_delay, "Connection lost, reconnecting");

        tokio::spawn(async move {
            // Best effort; the socket is usually already gone.
            let _ = dead.close(CLOSE_NORMAL, "reconnecting").await;
        });
    }

    async fn disconnect(&self, code: u16, reason: &str) {
        let previous = std::mem::replace(&mut *self.state.lock(), State::Disconnected);

        match previous {
            State::Disconnected => return,
            State::Connecting(attempt) | State::Reconnecting { attempt, .. } => {
                debug!(attempt = attempt.id, "Cancelling connect attempt");
                attempt.token.cancel();
            }
            State::Connected {
                transport, epoch, ..
            } => {
                epoch.cancel();
                if let Err(e) = transport.close(code, reason).await {
                    debug!(error = %e, "Error closing transport");
                }
            }
        }

        info!(code, reason = %reason, "Disconnected");
        self.publish(ConnectionStatus::Disconnected);
        self.emit(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{memory_transport, MemoryListener, MemoryTransportFactory};

    fn manager(
        reconnect_delay: Duration,
    ) -> (
        ConnectionManager,
        mpsc::UnboundedReceiver<ConnectionEvent>,
        MemoryTransportFactory,
        MemoryListener,
    ) {
        let (factory, listener) = memory_transport();
        let mut config = ConnectionConfig::new("memory://test");
        config.reconnect_delay = reconnect_delay;
        let (manager, events) = ConnectionManager::new(config, Arc::new(factory.clone()));
        (manager, events, factory, listener)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_connect() {
        let (manager, mut events, factory, _listener) = manager(Duration::from_secs(1));
        factory.set_connect_delay(Duration::from_millis(50));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.connect().await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(factory.connect_count(), 1);
        assert!(manager.is_connected());
        assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));

        manager.connect().await.unwrap();
        assert_eq!(factory.connect_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disconnect_racing_connect_ends_disconnected() {
        for _ in 0..50 {
            let (manager, mut events, _factory, mut listener) = manager(Duration::from_secs(60));
            let accepting = tokio::spawn(async move {
                let mut servers = Vec::new();
                while let Some(server) = listener.accept().await {
                    servers.push(server);
                }
            });

            let connecting = tokio::spawn({
                let manager = manager.clone();
                async move { manager.connect().await }
            });
            let mut status = manager.subscribe_status();
            status
                .wait_for(|status| *status != ConnectionStatus::Disconnected)
                .await
                .unwrap();
            manager.disconnect(CLOSE_NORMAL, "bye").await;
            let _ = connecting.await.unwrap();

            let mut last = None;
            while let Ok(event) = events.try_recv() {
                last = Some(event);
            }
            if let Some(event) = last {
                assert!(matches!(event, ConnectionEvent::Disconnected { .. }));
            }
            assert_eq!(manager.status(), ConnectionStatus::Disconnected);
            assert_eq!(*manager.subscribe_status().borrow(), ConnectionStatus::Disconnected);
            accepting.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_reports_to_every_caller() {
        let (manager, _events, factory, _listener) = manager(Duration::from_secs(1));
        factory.fail_next(1);
        factory.set_connect_delay(Duration::from_millis(10));

        let other = manager.clone();
        let (a, b) = tokio::join!(manager.connect(), other.connect());
        assert!(matches!(a, Err(TransportError::ConnectFailed(_))));
        assert!(matches!(b, Err(TransportError::ConnectFailed(_))));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(factory.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_error() {
        let delay = Duration::from_secs(2);
        let (manager, mut events, factory, mut listener) = manager(delay);

        manager.connect().await.unwrap();
        let server = listener.accept().await.unwrap();
        assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));

        server.fail("socket reset");
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Reconnecting { .. })
        ));
        assert_eq!(manager.status(), ConnectionStatus::Reconnecting);
        assert_eq!(factory.connect_count(), 1);

        tokio::time::sleep(delay / 2).await;
        assert_eq!(factory.connect_count(), 1);

        assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));
        assert_eq!(factory.connect_count(), 2);
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_triggers_reconnect() {
        let (manager, mut events, _factory, mut listener) = manager(Duration::from_secs(1));
        manager.connect().await.unwrap();
        let server = listener.accept().await.unwrap();
        events.recv().await;

        drop(server);
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Reconnecting { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_attempt() {
        let (manager, mut events, factory, _listener) = manager(Duration::from_secs(1));
        factory.set_hang(true);

        let connecting = manager.clone();
        let handle = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        assert_eq!(factory.connect_count(), 1);

        manager.disconnect(CLOSE_NORMAL, "user").await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(TransportError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(factory.cancelled_count(), 1);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::Disconnected {
                reason: "user".into()
            })
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_reconnect_delay() {
        let (manager, mut events, factory, mut listener) = manager(Duration::from_secs(5));
        manager.connect().await.unwrap();
        let server = listener.accept().await.unwrap();
        events.recv().await;

        server.fail("gone");
        events.recv().await;
        manager.disconnect(CLOSE_NORMAL, "user").await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(factory.connect_count(), 1);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_error_ignored_when_not_connected() {
        let (manager, _events, factory, _listener) = manager(Duration::from_millis(10));
        manager.handle_error(TransportError::ConnectionClosed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(factory.connect_count(), 0);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        manager.connect().await.unwrap();
        manager.handle_error(TransportError::Cancelled);
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_disconnects() {
        let (manager, mut events, _factory, mut listener) = manager(Duration::from_secs(1));
        manager.connect().await.unwrap();
        let mut server = listener.accept().await.unwrap();
        events.recv().await;

        server.send_text("hello");
        assert_eq!(events.recv().await, Some(ConnectionEvent::Text("hello".into())));

        server.close(4000, "shutdown");
        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::Disconnected {
                reason: "shutdown".into()
            })
        );
        assert_eq!(server.recv().await, None);
        assert_eq!(server.close_frame(), Some(&(4000, "shutdown".to_string())));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (manager, _events, _factory, mut listener) = manager(Duration::from_secs(1));
        assert!(matches!(
            manager.send(WireFrame::Text("x".into())).await,
            Err(TransportError::NotConnected)
        ));

        manager.connect().await.unwrap();
        let mut server = listener.accept().await.unwrap();
        manager.send(WireFrame::Text("x".into())).await.unwrap();
        assert_eq!(server.recv().await, Some(WireFrame::Text("x".into())));
    }
}
