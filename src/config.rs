//! Configuration for the relay server and the connection manager.
//!
//! Every field has a default, so an empty TOML file (or no file at all)
//! yields a working setup. CLI flags are applied on top by `main`.
//!
//! ```toml
//! [server]
//! port = 9000
//! roster_interval_secs = 15
//!
//! [client]
//! url = "ws://dashboard.local/ws"
//!
//! [client.reconnect]
//! interval_ms = 3000
//! max_attempts = 5
//! manual_connect = "honor_cap"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CollabError, Result};

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl AppConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&raw)?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.broadcast_capacity == 0 {
            return Err(CollabError::Config(
                "server.broadcast_capacity must be > 0".to_string(),
            ));
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(CollabError::Config(format!(
                "server.ws_path must start with '/': {}",
                self.server.ws_path
            )));
        }
        if self.client.event_log_capacity == 0 {
            return Err(CollabError::Config(
                "client.event_log_capacity must be > 0".to_string(),
            ));
        }
        validate_endpoint(&self.client.url)
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path that accepts WebSocket upgrades.
    pub ws_path: String,
    /// Seconds between full roster broadcasts. 0 disables the resync.
    pub roster_interval_secs: u64,
    /// Capacity of the fan-out channel; slow receivers past this lag.
    pub broadcast_capacity: usize,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn roster_interval(&self) -> Option<Duration> {
        (self.roster_interval_secs > 0).then(|| Duration::from_secs(self.roster_interval_secs))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ws_path: "/ws".to_string(),
            roster_interval_secs: 30,
            broadcast_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Full `ws://` or `wss://` endpoint.
    pub url: String,
    /// Delay before the first automatic connect at start-up.
    pub auto_connect_delay_ms: u64,
    /// How many collaboration events the view keeps.
    pub event_log_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn auto_connect_delay(&self) -> Duration {
        Duration::from_millis(self.auto_connect_delay_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            auto_connect_delay_ms: 1_000,
            event_log_capacity: 100,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// What an explicit `connect()` does once automatic retries are exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualConnect {
    /// An explicit connect always runs and resets the attempt counter.
    #[default]
    Override,
    /// An explicit connect is refused while the counter sits at the cap.
    HonorCap,
}

/// Fixed-interval reconnect with an attempt cap. No jitter, no growth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
    pub manual_connect: ManualConnect,
}

impl ReconnectPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Whether another automatic attempt may be scheduled after `attempts`.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 3_000,
            max_attempts: 5,
            manual_connect: ManualConnect::Override,
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint helpers
// ---------------------------------------------------------------------------

/// Reject anything that is not `ws://host...` or `wss://host...`.
pub fn validate_endpoint(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))
        .ok_or_else(|| CollabError::InvalidEndpoint(url.to_string()))?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(CollabError::InvalidEndpoint(url.to_string()));
    }
    Ok(())
}

/// Derive the socket endpoint from the page origin: `https` maps to `wss`,
/// anything else to `ws`. The path is always `ws_path`.
pub fn endpoint_for_origin(origin: &str, ws_path: &str) -> String {
    let (scheme, rest) = match origin.split_once("://") {
        Some(("https", rest)) => ("wss", rest),
        Some((_, rest)) => ("ws", rest),
        None => ("ws", origin),
    };
    let host = rest.split('/').next().unwrap_or(rest);
    format!("{scheme}://{host}{ws_path}")
}
