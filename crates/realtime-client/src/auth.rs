//! Access tokens.
//!
//! Tokens are opaque to the client except for the JWT `exp` claim, which is
//! checked so an expired token is never sent to the server.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{RealtimeError, Result};

/// Supplies the access token sent with each join.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Current token, or `None` when there is no session.
    async fn access_token(&self) -> Option<String>;
}

/// A provider that always returns the same token.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Option<String> {
        self.token.clone()
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Read the `exp` claim of a JWT. Returns `None` for tokens that are not
/// JWTs or carry no expiry.
#[must_use]
pub fn token_expiry(token: &str) -> Option<i64> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice::<Claims>(&decoded).ok()?.exp
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Reject tokens whose `exp` lies before `now` (seconds since the epoch).
///
/// # Errors
///
/// Returns [`RealtimeError::InvalidToken`] for an expired token.
pub fn check_expiry_at(token: &str, now: i64) -> Result<()> {
    match token_expiry(token) {
        Some(exp) if exp < now => Err(RealtimeError::InvalidToken(format!(
            "token expired at {} ({}s ago)",
            exp,
            now - exp
        ))),
        _ => Ok(()),
    }
}

/// Reject tokens that have already expired.
///
/// # Errors
///
/// Returns [`RealtimeError::InvalidToken`] for an expired token.
pub fn check_expiry(token: &str) -> Result<()> {
    check_expiry_at(token, now_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt(claims: &str) -> String {
        format!(
            "{}.{}.signature",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(claims)
        )
    }

    #[test]
    fn test_token_expiry() {
        assert_eq!(token_expiry(&jwt(r#"{"exp":1700000000}"#)), Some(1_700_000_000));
        assert_eq!(token_expiry(&jwt(r#"{"sub":"user"}"#)), None);
        assert_eq!(token_expiry("not-a-jwt"), None);
        assert_eq!(token_expiry("a.!!!.c"), None);
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = jwt(r#"{"exp":1000}"#);
        assert!(matches!(
            check_expiry_at(&token, 2000),
            Err(RealtimeError::InvalidToken(_))
        ));
        assert!(check_expiry_at(&token, 500).is_ok());
        assert!(check_expiry_at("opaque-key", 2000).is_ok());
    }

    #[test]
    fn test_far_future_token_accepted() {
        assert!(check_expiry(&jwt(r#"{"exp":32503680000}"#)).is_ok());
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticTokenProvider::new(Some("t".into()));
        assert_eq!(provider.access_token().await.as_deref(), Some("t"));
        assert_eq!(StaticTokenProvider::default().access_token().await, None);
    }
}
