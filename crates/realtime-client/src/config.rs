//! Client configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (REALTIME_API_KEY)
//! - TOML configuration file
//! - Code, starting from `ClientConfig::default()`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use realtime_core::Backoff;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// API key sent as the `apikey` query parameter and header.
    #[serde(default = "default_api_key")]
    pub api_key: String,

    /// Extra headers sent when connecting.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Delay before reconnecting after the connection drops, in milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Timeout for joins and acknowledged pushes, in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Disconnect instead of joining anonymously once the token provider
    /// stops returning a token.
    #[serde(default)]
    pub disconnect_on_session_loss: bool,

    /// Connect automatically when a channel subscribes.
    #[serde(default = "default_true")]
    pub connect_on_subscribe: bool,

    /// Join attempts before a subscribe gives up.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Join retry backoff.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Join retry backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound for any retry delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Growth factor between consecutive retries.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

// Default value functions
fn default_api_key() -> String {
    std::env::var("REALTIME_API_KEY").unwrap_or_default()
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    25_000 // 25 seconds
}

fn default_reconnect_delay() -> u64 {
    7_000
}

fn default_timeout() -> u64 {
    10_000
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
            headers: HashMap::new(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            reconnect_delay_ms: default_reconnect_delay(),
            timeout_ms: default_timeout(),
            disconnect_on_session_loss: false,
            connect_on_subscribe: true,
            max_retry_attempts: default_max_retry_attempts(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

impl ClientConfig {
    /// Defaults tuned for faster dead-connection detection.
    #[must_use]
    pub fn low_latency() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            ..Self::default()
        }
    }

    /// Set the API key.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = ["realtime.toml", "~/.config/realtime/realtime.toml"];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(contents).context("Invalid configuration")?;
        anyhow::ensure!(config.heartbeat_interval_ms > 0, "heartbeat_interval_ms must be positive");
        anyhow::ensure!(config.retry.multiplier >= 1.0, "retry.multiplier must be at least 1.0");
        Ok(config)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Join retry policy.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            self.retry.multiplier,
        )
    }
}
