//! Server configuration.
//!
//! Loaded from the first TOML file found among `murmur.toml`,
//! `/etc/murmur/murmur.toml` and `~/.config/murmur/murmur.toml`, falling
//! back to defaults. `MURMUR_HOST` and `MURMUR_PORT` override the bind
//! address either way.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use murmur_core::{BusConfig, EngineConfig, HubConfig, PresenceConfig, SessionConfig};
use murmur_protocol::{Encoding, RoomId, UserId};
use murmur_transport::WebSocketConfig;
use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub hub: HubSection,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub presence: PresenceSection,

    #[serde(default)]
    pub bus: BusSection,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Room memberships seeded into the in-memory persistence store.
    #[serde(default)]
    pub rooms: Vec<RoomSeed>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Send MessagePack binary frames instead of JSON text.
    #[serde(default)]
    pub binary: bool,
}

/// Hub and session queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,

    /// Per-session outbound queue capacity in frames.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Membership reconciliation interval in milliseconds.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_ms: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Read timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,

    /// Write timeout in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSection {
    /// Online record TTL in seconds.
    #[serde(default = "default_presence_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Redis URL for the shared presence store. In-memory when unset.
    #[serde(default)]
    pub redis_url: Option<String>,
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Published message TTL in milliseconds.
    #[serde(default = "default_message_ttl")]
    pub message_ttl_ms: u64,

    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Header carrying the authenticated user id, set by the gateway.
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// A room and its members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSeed {
    pub id: RoomId,
    #[serde(default)]
    pub members: Vec<UserId>,
}

fn default_host() -> String {
    std::env::var("MURMUR_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("MURMUR_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    4 * 1024
}

fn default_request_capacity() -> usize {
    HubConfig::default().request_capacity
}

fn default_outbound_capacity() -> usize {
    SessionConfig::default().outbound_capacity
}

fn default_reconcile_interval() -> u64 {
    60_000
}

fn default_heartbeat_interval() -> u64 {
    54_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_presence_ttl() -> u64 {
    120
}

fn default_event_capacity() -> usize {
    PresenceConfig::default().event_capacity
}

fn default_message_ttl() -> u64 {
    30_000
}

fn default_workers() -> usize {
    BusConfig::default().workers
}

fn default_user_header() -> String {
    "x-user-id".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            hub: HubSection::default(),
            heartbeat: HeartbeatConfig::default(),
            presence: PresenceSection::default(),
            bus: BusSection::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
            rooms: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
            binary: false,
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            request_capacity: default_request_capacity(),
            outbound_capacity: default_outbound_capacity(),
            reconcile_interval_ms: default_reconcile_interval(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_presence_ttl(),
            event_capacity: default_event_capacity(),
            redis_url: None,
        }
    }
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            enabled: true,
            message_ttl_ms: default_message_ttl(),
            workers: default_workers(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user_header: default_user_header(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "murmur.toml",
            "/etc/murmur/murmur.toml",
            "~/.config/murmur/murmur.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                let mut config = Self::from_file(expanded.as_ref())?;
                config.apply_env();
                return Ok(config);
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

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    // File values lose to the environment
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("MURMUR_HOST") {
            self.host = host;
        }
        if let Some(port) = std::env::var("MURMUR_PORT").ok().and_then(|p| p.parse().ok()) {
            self.port = port;
        }
    }

    /// The socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Core engine configuration derived from this file.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            hub: HubConfig {
                request_capacity: self.hub.request_capacity,
            },
            session: SessionConfig {
                outbound_capacity: self.hub.outbound_capacity,
                heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms),
                read_timeout: Duration::from_millis(self.heartbeat.timeout_ms),
                write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
                ..defaults.session
            },
            presence: PresenceConfig {
                ttl: Duration::from_secs(self.presence.ttl_secs),
                event_capacity: self.presence.event_capacity,
                ..defaults.presence
            },
            bus: BusConfig {
                message_ttl: Duration::from_millis(self.bus.message_ttl_ms),
                workers: self.bus.workers,
                ..defaults.bus
            },
            reconcile_interval: Duration::from_millis(self.hub.reconcile_interval_ms),
        }
    }

    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: self.transport.max_message_size,
            encoding: if self.transport.binary {
                Encoding::MessagePack
            } else {
                Encoding::Json
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.transport.max_message_size, 4096);
        assert_eq!(config.auth.user_header, "x-user-id");
        assert!(config.presence.redis_url.is_none());
        assert!(config.rooms.is_empty());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 9100,
            ..Config::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 9100);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [hub]
            outbound_capacity = 64

            [heartbeat]
            interval_ms = 5000
            timeout_ms = 8000

            [presence]
            redis_url = "redis://127.0.0.1:6379"

            [[rooms]]
            id = 7
            members = [1, 2]

            [[rooms]]
            id = 8
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.hub.outbound_capacity, 64);
        assert_eq!(config.hub.request_capacity, 1024);
        assert_eq!(config.presence.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.rooms.len(), 2);
        assert_eq!(config.rooms[0].members, vec![1, 2]);
        assert!(config.rooms[1].members.is_empty());
    }

    #[test]
    fn test_engine_config_conversion() {
        let config: Config = toml::from_str(
            r#"
            [heartbeat]
            interval_ms = 5000
            timeout_ms = 8000

            [bus]
            workers = 2
            "#,
        )
        .unwrap();

        let engine = config.engine_config();
        assert_eq!(engine.session.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(engine.session.read_timeout, Duration::from_secs(8));
        assert_eq!(engine.session.write_timeout, Duration::from_secs(10));
        assert_eq!(engine.session.outbound_capacity, 256);
        assert_eq!(engine.presence.ttl, Duration::from_secs(120));
        assert_eq!(engine.bus.workers, 2);
        assert_eq!(engine.reconcile_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_websocket_encoding() {
        let mut config = Config::default();
        assert_eq!(config.websocket_config().encoding, Encoding::Json);
        config.transport.binary = true;
        assert_eq!(config.websocket_config().encoding, Encoding::MessagePack);
    }
}
