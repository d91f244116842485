//! Client configuration.
//!
//! Every option is independently defaulted so a config can be built
//! from a bare server URL, deserialized from JSON/TOML with partial
//! fields, or loaded from `TETHER_*` environment variables. Malformed
//! environment values fall back to their defaults with a warning
//! rather than aborting startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment variable names
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const ENV_SERVER_URL: &str = "TETHER_SERVER_URL";
pub const ENV_AUTH_TOKEN: &str = "TETHER_AUTH_TOKEN";
pub const ENV_RECONNECT_ENABLED: &str = "TETHER_RECONNECT_ENABLED";
pub const ENV_RECONNECT_INITIAL_DELAY_MS: &str = "TETHER_RECONNECT_INITIAL_DELAY_MS";
pub const ENV_RECONNECT_MAX_DELAY_MS: &str = "TETHER_RECONNECT_MAX_DELAY_MS";
pub const ENV_RECONNECT_MULTIPLIER: &str = "TETHER_RECONNECT_MULTIPLIER";
pub const ENV_HEARTBEAT_ENABLED: &str = "TETHER_HEARTBEAT_ENABLED";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "TETHER_HEARTBEAT_INTERVAL_MS";
pub const ENV_HEARTBEAT_TIMEOUT_MS: &str = "TETHER_HEARTBEAT_TIMEOUT_MS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "TETHER_CONNECT_TIMEOUT_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "TETHER_REQUEST_TIMEOUT_MS";
pub const ENV_STREAM_RECONNECT_DELAY_MS: &str = "TETHER_STREAM_RECONNECT_DELAY_MS";
pub const ENV_CLIENT_NAME: &str = "TETHER_CLIENT_NAME";
pub const ENV_CLIENT_VERSION: &str = "TETHER_CLIENT_VERSION";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config structs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Full configuration surface of the agent client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Control plane endpoint. Required, `http://` or `https://` only.
    pub server_url: String,
    /// Sent as `Authorization: Bearer <token>` when set.
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default = "d_10000")]
    pub connect_timeout_ms: u64,
    #[serde(default = "d_30000")]
    pub request_timeout_ms: u64,
    #[serde(default = "d_3000")]
    pub stream_reconnect_delay_ms: u64,
    #[serde(default = "d_client_name")]
    pub client_name: String,
    #[serde(default = "d_client_version")]
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_5000")]
    pub initial_delay_ms: u64,
    #[serde(default = "d_300000")]
    pub max_delay_ms: u64,
    #[serde(default = "d_multiplier")]
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 5_000,
            max_delay_ms: 300_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_30000")]
    pub interval_ms: u64,
    #[serde(default = "d_10000")]
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 10_000,
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_3000() -> u64 {
    3_000
}
fn d_5000() -> u64 {
    5_000
}
fn d_10000() -> u64 {
    10_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_300000() -> u64 {
    300_000
}
fn d_multiplier() -> f64 {
    2.0
}
fn d_client_name() -> String {
    "tether-agent".into()
}
fn d_client_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

impl ClientConfig {
    /// Config with all defaults for the given server URL.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            auth_token: None,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            connect_timeout_ms: d_10000(),
            request_timeout_ms: d_30000(),
            stream_reconnect_delay_ms: d_3000(),
            client_name: d_client_name(),
            client_version: d_client_version(),
        }
    }

    /// Load from `TETHER_*` environment variables.
    ///
    /// `TETHER_SERVER_URL` may be absent here; `validate()` is the
    /// gate that rejects a missing or malformed URL.
    pub fn from_env() -> Self {
        let mut config = Self::new(std::env::var(ENV_SERVER_URL).unwrap_or_default());
        config.auth_token = std::env::var(ENV_AUTH_TOKEN).ok().filter(|t| !t.is_empty());

        env_bool(ENV_RECONNECT_ENABLED, &mut config.reconnect.enabled);
        env_u64(ENV_RECONNECT_INITIAL_DELAY_MS, &mut config.reconnect.initial_delay_ms);
        env_u64(ENV_RECONNECT_MAX_DELAY_MS, &mut config.reconnect.max_delay_ms);
        env_f64(ENV_RECONNECT_MULTIPLIER, &mut config.reconnect.multiplier);
        env_bool(ENV_HEARTBEAT_ENABLED, &mut config.heartbeat.enabled);
        env_u64(ENV_HEARTBEAT_INTERVAL_MS, &mut config.heartbeat.interval_ms);
        env_u64(ENV_HEARTBEAT_TIMEOUT_MS, &mut config.heartbeat.timeout_ms);
        env_u64(ENV_CONNECT_TIMEOUT_MS, &mut config.connect_timeout_ms);
        env_u64(ENV_REQUEST_TIMEOUT_MS, &mut config.request_timeout_ms);
        env_u64(ENV_STREAM_RECONNECT_DELAY_MS, &mut config.stream_reconnect_delay_ms);

        if let Ok(name) = std::env::var(ENV_CLIENT_NAME) {
            if !name.is_empty() {
                config.client_name = name;
            }
        }
        if let Ok(version) = std::env::var(ENV_CLIENT_VERSION) {
            if !version.is_empty() {
                config.client_version = version;
            }
        }

        config
    }

    /// Reject configurations the client cannot start with. Fatal at
    /// startup; never retried.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.server_url.is_empty() {
            return Err(ClientError::Config("server_url is required".into()));
        }
        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(ClientError::Config(format!(
                "server_url must start with http:// or https://, got: {}",
                self.server_url
            )));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ClientError::Config(format!(
                "reconnect.multiplier must be >= 1.0, got: {}",
                self.reconnect.multiplier
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stream_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.stream_reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms)
    }

    /// How long the event stream may stay silent before we declare it
    /// dead: 2.5x the heartbeat interval, so a slightly late server
    /// ping never trips it on the boundary.
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms * 5 / 2)
    }
}

fn env_bool(key: &str, target: &mut bool) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<bool>() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring malformed boolean env var"),
        }
    }
}

fn env_u64(key: &str, target: &mut u64) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<u64>() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring malformed integer env var"),
        }
    }
}

fn env_f64(key: &str, target: &mut f64) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<f64>() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring malformed float env var"),
        }
    }
}
