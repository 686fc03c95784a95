//! WebSocket transport implementation.
//!
//! This module provides a WebSocket client transport using tokio-tungstenite.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{future, SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::traits::{EventStream, Transport, TransportError, TransportEvent, TransportFactory, WireFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketFactory;

impl WebSocketFactory {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebSocketFactory {
    async fn connect(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectFailed(format!("Invalid URL: {}", e)))?;

        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::ConnectFailed(format!("Invalid header name: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::ConnectFailed(format!("Invalid header value: {}", e)))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        debug!(status = %response.status(), "WebSocket handshake completed");

        let (sink, stream) = stream.split();
        Ok(Arc::new(WebSocketTransport {
            sink: Mutex::new(sink),
            stream: parking_lot::Mutex::new(Some(stream)),
            is_open: AtomicBool::new(true),
        }))
    }
}

/// A WebSocket connection.
pub struct WebSocketTransport {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: parking_lot::Mutex<Option<SplitStream<WsStream>>>,
    is_open: AtomicBool,
}

fn convert(message: Result<Message, WsError>) -> Option<Result<TransportEvent, TransportError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(TransportEvent::Text(text))),
        Ok(Message::Binary(data)) => Some(Ok(TransportEvent::Binary(Bytes::from(data)))),
        Ok(Message::Close(frame)) => {
            let (code, reason) = match frame {
                Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                None => (u16::from(CloseCode::Status), String::new()),
            };
            Some(Ok(TransportEvent::Close { code, reason }))
        }
        // Pongs are queued by tungstenite itself.
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
            Some(Err(TransportError::ConnectionClosed))
        }
        Err(e) => Some(Err(TransportError::ReceiveFailed(e.to_string()))),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, frame: WireFrame) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(data) => Message::Binary(data.to_vec()),
        };

        let mut sink = self.sink.lock().await;
        sink.send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };

        let mut sink = self.sink.lock().await;
        match sink.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Failed to send close frame");
                Err(TransportError::Other(format!("Failed to close: {}", e)))
            }
        }
    }

    fn events(&self) -> Option<EventStream> {
        let stream = self.stream.lock().take()?;
        Some(
            stream
                .filter_map(|message| future::ready(convert(message)))
                .boxed(),
        )
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}
