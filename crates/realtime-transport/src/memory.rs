//! In-process transport.
//!
//! [`memory_transport`] returns a factory and a listener. Every successful
//! connect hands the listener a [`ServerEnd`] that plays the server's side of
//! the socket. The factory can be told to fail, delay or hang connects, and
//! counts attempts that were abandoned mid-connect.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::traits::{EventStream, Transport, TransportError, TransportEvent, TransportFactory, WireFrame};

type ServerEvent = Result<TransportEvent, TransportError>;

/// What the client side did to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Frame(WireFrame),
    Close { code: u16, reason: String },
}

#[derive(Debug, Default)]
struct Behavior {
    connect_delay: Duration,
    hang: bool,
    fail_next: usize,
}

struct Shared {
    accepted: mpsc::UnboundedSender<ServerEnd>,
    connects: AtomicUsize,
    cancelled: AtomicUsize,
    behavior: Mutex<Behavior>,
}

/// Create a connected factory/listener pair.
#[must_use]
pub fn memory_transport() -> (MemoryTransportFactory, MemoryListener) {
    let (accepted, incoming) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        accepted,
        connects: AtomicUsize::new(0),
        cancelled: AtomicUsize::new(0),
        behavior: Mutex::new(Behavior::default()),
    });
    (MemoryTransportFactory { shared }, MemoryListener { incoming })
}

/// Counts a connect as cancelled if its future is dropped before finishing.
struct CancelGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.cancelled.fetch_add(1, Ordering::SeqCst);
            debug!("Memory connect abandoned");
        }
    }
}

/// Factory side of an in-process transport.
#[derive(Clone)]
pub struct MemoryTransportFactory {
    shared: Arc<Shared>,
}

impl MemoryTransportFactory {
    /// Number of connect calls started.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Number of connect calls abandoned before completing.
    #[must_use]
    pub fn cancelled_count(&self) -> usize {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Delay every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.shared.behavior.lock().connect_delay = delay;
    }

    /// Make connects never complete.
    pub fn set_hang(&self, hang: bool) {
        self.shared.behavior.lock().hang = hang;
    }

    /// Refuse the next `count` connects.
    pub fn fail_next(&self, count: usize) {
        self.shared.behavior.lock().fail_next = count;
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn connect(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let mut guard = CancelGuard {
            shared: &self.shared,
            armed: true,
        };

        let (delay, hang, fail) = {
            let mut behavior = self.shared.behavior.lock();
            let fail = behavior.fail_next > 0;
            if fail {
                behavior.fail_next -= 1;
            }
            (behavior.connect_delay, behavior.hang, fail)
        };

        if hang {
            std::future::pending::<()>().await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        guard.armed = false;

        if fail {
            return Err(TransportError::ConnectFailed("connection refused".into()));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        let server = ServerEnd {
            url: url.to_string(),
            headers: headers.clone(),
            from_client: client_rx,
            to_client: server_tx,
            close: None,
        };
        self.shared
            .accepted
            .send(server)
            .map_err(|_| TransportError::ConnectFailed("listener dropped".into()))?;

        Ok(Arc::new(MemoryTransport {
            to_server: client_tx,
            from_server: Mutex::new(Some(server_rx)),
            open: AtomicBool::new(true),
        }))
    }
}

/// Receives the server ends of accepted connections.
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<ServerEnd>,
}

impl MemoryListener {
    /// Wait for the next connection. Returns `None` once the factory is gone.
    pub async fn accept(&mut self) -> Option<ServerEnd> {
        self.incoming.recv().await
    }

    /// Take an already accepted connection without waiting.
    pub fn try_accept(&mut self) -> Option<ServerEnd> {
        self.incoming.try_recv().ok()
    }
}

/// The server's side of an in-process socket.
pub struct ServerEnd {
    url: String,
    headers: HashMap<String, String>,
    from_client: mpsc::UnboundedReceiver<ClientAction>,
    to_client: mpsc::UnboundedSender<ServerEvent>,
    close: Option<(u16, String)>,
}

impl ServerEnd {
    /// URL the client connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Headers the client connected with.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Next frame from the client. Returns `None` once the client closed.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        match self.from_client.recv().await? {
            ClientAction::Frame(frame) => Some(frame),
            ClientAction::Close { code, reason } => {
                self.close = Some((code, reason));
                None
            }
        }
    }

    /// Next frame from the client if one is queued.
    pub fn try_recv(&mut self) -> Option<WireFrame> {
        match self.from_client.try_recv().ok()? {
            ClientAction::Frame(frame) => Some(frame),
            ClientAction::Close { code, reason } => {
                self.close = Some((code, reason));
                None
            }
        }
    }

    /// Close code and reason the client sent, once seen by `recv`.
    #[must_use]
    pub fn close_frame(&self) -> Option<&(u16, String)> {
        self.close.as_ref()
    }

    /// Send a text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client
            .send(Ok(TransportEvent::Text(text.into())))
            .is_ok()
    }

    /// Send a binary frame to the client.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.to_client
            .send(Ok(TransportEvent::Binary(data.into())))
            .is_ok()
    }

    /// Close the socket from the server side.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.to_client
            .send(Ok(TransportEvent::Close {
                code,
                reason: reason.into(),
            }))
            .is_ok()
    }

    /// Make the client's event stream fail.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.to_client
            .send(Err(TransportError::ReceiveFailed(reason.into())))
            .is_ok()
    }
}

/// Client side of an in-process socket.
struct MemoryTransport {
    to_server: mpsc::UnboundedSender<ClientAction>,
    from_server: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    open: AtomicBool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: WireFrame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.to_server
            .send(ClientAction::Frame(frame))
            .map_err(|_| TransportError::SendFailed("server end dropped".into()))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // The server end may already be gone.
        let _ = self.to_server.send(ClientAction::Close {
            code,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn events(&self) -> Option<EventStream> {
        let receiver = self.from_server.lock().take()?;
        Some(
            stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|event| (event, receiver))
            })
            .boxed(),
        )
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
