//! Server configuration model.
//!
//! Loaded from a TOML file; every section and key has a default so the
//! server starts with no configuration file at all.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DependencySnafu, InvalidInputSnafu};
use crate::Result;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Logging options.
    pub log: LogConfig,
    /// Framed TCP front-end.
    pub tcp: TcpConfig,
    /// WebSocket front-end.
    pub websocket: WebSocketConfig,
    /// HTTP + GraphQL front-end.
    pub api: ApiConfig,
    /// Pub/sub broker back-end.
    pub pubsub: PubSubConfig,
    /// Reference auth collaborators.
    pub auth: AuthConfig,
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|error| {
            DependencySnafu {
                message: format!("failed to read config file {}: {error}", path.display()),
            }
            .build()
        })?;
        toml::from_str(&raw).map_err(|error| {
            InvalidInputSnafu {
                message: format!("invalid config file {}: {error}", path.display()),
            }
            .build()
        })
    }
}

/// Logging options.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Default tracing filter directive (overridden by `RUST_LOG`).
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

/// Framed TCP front-end options.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpConfig {
    /// Whether to start the TCP listener.
    pub enabled: bool,
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Global connection cap; further accepts are rejected.
    pub max_connections: usize,
    /// Per-IP connection cap.
    pub max_connections_per_ip: usize,
    /// Hard limit on announced frame sizes, enforced by parser and codec.
    pub max_frame_size: usize,
    /// Keepalive PING cadence in milliseconds.
    pub ping_interval_ms: u64,
    /// Idle threshold base in milliseconds; eviction happens at twice this.
    pub ping_timeout_ms: u64,
    /// OS-level TCP keepalive interval in milliseconds.
    pub keep_alive_interval_ms: u64,
    /// Graceful drain window on shutdown in milliseconds.
    pub drain_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_owned(),
            port: 9100,
            max_connections: 1000,
            max_connections_per_ip: 10,
            max_frame_size: courier_wire::DEFAULT_MAX_FRAME_SIZE,
            ping_interval_ms: 30_000,
            ping_timeout_ms: 60_000,
            keep_alive_interval_ms: 60_000,
            drain_timeout_ms: 5_000,
        }
    }
}

impl TcpConfig {
    /// Keepalive PING cadence.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Idle threshold base.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// OS keepalive interval.
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Graceful drain window.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// WebSocket front-end options. The session is served on the API listener
/// under `/ws`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebSocketConfig {
    /// Whether to serve the WebSocket session endpoint.
    pub enabled: bool,
    /// Global connection cap.
    pub max_connections: usize,
    /// Per-IP connection cap.
    pub max_connections_per_ip: usize,
    /// Keepalive ping cadence in milliseconds.
    pub ping_interval_ms: u64,
    /// Idle threshold base in milliseconds; eviction happens at twice this.
    pub ping_timeout_ms: u64,
    /// Graceful drain window on shutdown in milliseconds.
    pub drain_timeout_ms: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections: 1000,
            max_connections_per_ip: 10,
            ping_interval_ms: 30_000,
            ping_timeout_ms: 60_000,
            drain_timeout_ms: 5_000,
        }
    }
}

impl WebSocketConfig {
    /// Keepalive ping cadence.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Idle threshold base.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Graceful drain window.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// HTTP + GraphQL front-end options.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    /// Whether to start the HTTP listener.
    pub enabled: bool,
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_owned(),
            port: 9101,
        }
    }
}

/// Selects the pub/sub back-end.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PubSubAdapterKind {
    /// In-process direct dispatch.
    #[default]
    Memory,
    /// External shared NATS bus.
    Nats,
}

/// Pub/sub broker options.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PubSubConfig {
    /// Which adapter to use.
    pub adapter: PubSubAdapterKind,
    /// In-memory adapter options.
    pub memory: MemoryPubSubConfig,
    /// NATS adapter options.
    pub nats: NatsPubSubConfig,
}

/// In-memory adapter options.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryPubSubConfig {
    /// Advisory bound on in-flight deliveries.
    pub max_messages: usize,
}

impl Default for MemoryPubSubConfig {
    fn default() -> Self {
        Self { max_messages: 1000 }
    }
}

/// NATS adapter options.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NatsPubSubConfig {
    /// Server URL.
    pub url: String,
}

impl Default for NatsPubSubConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_owned(),
        }
    }
}

/// Options for the reference auth collaborators.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Static token table: token → user id.
    pub tokens: HashMap<String, String>,
    /// Users known to the in-memory repository.
    pub users: Vec<UserEntry>,
}

/// A user seeded into the in-memory repository.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UserEntry {
    /// Unique user id.
    pub id: String,
    /// Display name.
    pub username: String,
}
