//! HTTP broadcast fallback.
//!
//! Broadcasts sent while a channel is not joined go over HTTP instead of the
//! socket.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use realtime_protocol::JsonObject;

/// HTTP fallback errors.
#[derive(Debug, Error)]
pub enum FallbackError {
    /// Request failed before a response arrived.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with something other than 202.
    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// The endpoint URL could not be derived.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The payload cannot be sent over HTTP.
    #[error("Unsupported payload: {0}")]
    Unsupported(&'static str),
}

/// One broadcast to deliver over HTTP.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackMessage {
    /// Topic without the `realtime:` prefix.
    pub topic: String,
    pub event: String,
    pub payload: JsonObject,
    pub private: bool,
}

/// Delivers broadcasts without a socket.
#[async_trait]
pub trait BroadcastFallback: Send + Sync {
    async fn broadcast(
        &self,
        message: FallbackMessage,
        access_token: Option<&str>,
    ) -> Result<(), FallbackError>;
}

#[derive(Serialize)]
struct BroadcastBody<'a> {
    messages: [&'a FallbackMessage; 1],
}

/// Derive the HTTP base URL from the socket endpoint.
///
/// `ws` becomes `http`, `wss` becomes `https`, and a trailing `/socket/websocket`,
/// `/socket` or `/websocket` is removed along with any query.
///
/// # Errors
///
/// Returns an error if the endpoint is not a valid URL.
pub fn http_base(endpoint: &str) -> Result<String, FallbackError> {
    let mut url =
        Url::parse(endpoint).map_err(|e| FallbackError::InvalidEndpoint(e.to_string()))?;

    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => other,
    }
    .to_string();
    url.set_scheme(&scheme)
        .map_err(|()| FallbackError::InvalidEndpoint(format!("cannot use scheme {}", scheme)))?;
    url.set_query(None);
    url.set_fragment(None);

    let mut path = url.path().trim_end_matches('/').to_string();
    for suffix in ["/socket/websocket", "/socket", "/websocket"] {
        if let Some(stripped) = path.strip_suffix(suffix) {
            path = stripped.to_string();
            break;
        }
    }
    url.set_path(&path);

    Ok(url.as_str().trim_end_matches('/').to_string())
}

/// Posts broadcasts to `<base>/api/broadcast`.
#[derive(Debug, Clone)]
pub struct HttpBroadcastFallback {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpBroadcastFallback {
    /// Create a fallback for the given socket endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid URL.
    pub fn new(socket_endpoint: &str, api_key: impl Into<String>) -> Result<Self, FallbackError> {
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/api/broadcast", http_base(socket_endpoint)?),
            api_key: api_key.into(),
        })
    }

    /// The URL broadcasts are posted to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BroadcastFallback for HttpBroadcastFallback {
    async fn broadcast(
        &self,
        message: FallbackMessage,
        access_token: Option<&str>,
    ) -> Result<(), FallbackError> {
        let token = access_token.unwrap_or(&self.api_key);
        let body = BroadcastBody {
            messages: [&message],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            debug!(topic = %message.topic, event = %message.event, "Broadcast sent over HTTP");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(FallbackError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_base() {
        assert_eq!(
            http_base("wss://abc.example.co/realtime/v1/websocket?apikey=k&vsn=2.0.0").unwrap(),
            "https://abc.example.co/realtime/v1"
        );
        assert_eq!(
            http_base("ws://localhost:4000/socket/websocket").unwrap(),
            "http://localhost:4000"
        );
        assert_eq!(
            http_base("ws://localhost:4000/socket").unwrap(),
            "http://localhost:4000"
        );
        assert!(http_base("not a url").is_err());
    }

    #[test]
    fn test_endpoint() {
        let fallback = HttpBroadcastFallback::new("wss://h.example/realtime/v1", "key").unwrap();
        assert_eq!(fallback.endpoint(), "https://h.example/realtime/v1/api/broadcast");
    }

    #[test]
    fn test_body_shape() {
        let message = FallbackMessage {
            topic: "room".into(),
            event: "cursor".into(),
            payload: JsonObject::new(),
            private: false,
        };
        let body = serde_json::to_value(BroadcastBody {
            messages: [&message],
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "messages": [{"topic": "room", "event": "cursor", "payload": {}, "private": false}]
            })
        );
    }
}
