//! Channel and server configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Path the WebSocket endpoint is mounted on, both sides.
pub const DEFAULT_PATH: &str = "/wsio/";

/// Interval between protocol pings.
pub const DEFAULT_HEARTBEAT_MS: u64 = 5_000;

/// Silence window after which a connection is declared dead.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Client-side connection settings.
///
/// The address is either an explicit `url`, or assembled from `host` and
/// `secure` as `{ws|wss}://{host}/wsio/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Full WebSocket URL. Overrides `host` and `secure` when set.
    pub url: Option<String>,
    /// Host and port used when `url` is not set.
    pub host: String,
    /// Use `wss://` instead of `ws://` when assembling the address. TLS
    /// comes from `rustls` with the webpki root set.
    pub secure: bool,
    /// Interval between protocol pings, in milliseconds.
    pub heartbeat_ms: u64,
    /// Silence window after which the connection is declared dead, in
    /// milliseconds. Zero disables liveness enforcement.
    pub timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost:8080".to_string(),
            secure: false,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl ChannelConfig {
    /// Config pointing at an explicit WebSocket URL.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// The address the channel will dial.
    pub fn resolve_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => {
                let scheme = if self.secure { "wss" } else { "ws" };
                format!("{}://{}{}", scheme, self.host, DEFAULT_PATH)
            }
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Server-side listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the TCP listener binds to.
    pub bind_addr: String,
    /// Path upgrades are accepted on. Requests elsewhere get a 404.
    pub path: String,
    /// Interval between protocol pings, in milliseconds.
    pub heartbeat_ms: u64,
    /// Silence window after which a peer is declared dead, in milliseconds.
    /// Zero disables liveness enforcement.
    pub timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            path: DEFAULT_PATH.to_string(),
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
