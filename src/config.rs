//! Runtime configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! Read once at startup. Numeric knobs fall back to their defaults when the
//! variable is absent or unparseable; only `DATABASE_URL` is required.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_BACKBONE_TOPIC: &str = "retro:broadcast";
pub const DEFAULT_BACKBONE_CONNECT_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_HUB_COMMAND_CAPACITY: usize = 1024;
pub const DEFAULT_BACKBONE_PUBLISH_CAPACITY: usize = 1024;
pub const DEFAULT_BACKBONE_PUBLISH_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_WS_OUTBOUND_CAPACITY: usize = 256;
pub const DEFAULT_WS_PING_INTERVAL_SECS: u64 = 27;
pub const DEFAULT_WS_PONG_WAIT_SECS: u64 = 30;
pub const DEFAULT_WS_WRITE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_WS_MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
}

/// Sizing for the dispatch loop and the fan-out bridge queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    pub command_capacity: usize,
    pub publish_capacity: usize,
    /// Deadline for one backbone publish before the payload is delivered locally.
    pub publish_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: DEFAULT_HUB_COMMAND_CAPACITY,
            publish_capacity: DEFAULT_BACKBONE_PUBLISH_CAPACITY,
            publish_timeout: Duration::from_millis(DEFAULT_BACKBONE_PUBLISH_TIMEOUT_MS),
        }
    }
}

/// Per-connection queue size and transport deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub outbound_capacity: usize,
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_timeout: Duration,
    pub max_message_bytes: usize,
}

impl ConnectionConfig {
    /// Keep the ping interval strictly inside the read deadline so a healthy
    /// peer's pong always lands before the deadline expires.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let ceiling = self.pong_wait * 9 / 10;
        if self.ping_interval.is_zero() || self.ping_interval > ceiling {
            self.ping_interval = ceiling;
        }
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_WS_OUTBOUND_CAPACITY,
            ping_interval: Duration::from_secs(DEFAULT_WS_PING_INTERVAL_SECS),
            pong_wait: Duration::from_secs(DEFAULT_WS_PONG_WAIT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WS_WRITE_TIMEOUT_SECS),
            max_message_bytes: DEFAULT_WS_MAX_MESSAGE_BYTES,
        }
    }
}

/// Backbone connection settings. `url: None` runs the hub in local-only mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneConfig {
    pub url: Option<String>,
    pub topic: String,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub backbone: BackboneConfig,
    pub hub: HubConfig,
    pub connection: ConnectionConfig,
}

impl Config {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`
    ///
    /// Optional:
    /// - `PORT`: default 8080
    /// - `DB_MAX_CONNECTIONS`: default 5
    /// - `REDIS_URL`: unset disables the backbone
    /// - `BACKBONE_TOPIC`: default `retro:broadcast`
    /// - `BACKBONE_CONNECT_TIMEOUT_MS`: default 2000
    /// - `HUB_COMMAND_CAPACITY`, `BACKBONE_PUBLISH_CAPACITY`: default 1024
    /// - `BACKBONE_PUBLISH_TIMEOUT_MS`: default 2000
    /// - `WS_OUTBOUND_CAPACITY`: default 256
    /// - `WS_PING_INTERVAL_SECS` / `WS_PONG_WAIT_SECS`: default 27 / 30
    /// - `WS_WRITE_TIMEOUT_SECS`: default 10
    /// - `WS_MAX_MESSAGE_BYTES`: default 65536
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if `DATABASE_URL` is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let backbone = BackboneConfig {
            url: std::env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
            topic: std::env::var("BACKBONE_TOPIC")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BACKBONE_TOPIC.to_string()),
            connect_timeout: Duration::from_millis(env_parse(
                "BACKBONE_CONNECT_TIMEOUT_MS",
                DEFAULT_BACKBONE_CONNECT_TIMEOUT_MS,
            )),
        };

        let hub = HubConfig {
            command_capacity: env_parse("HUB_COMMAND_CAPACITY", DEFAULT_HUB_COMMAND_CAPACITY).max(1),
            publish_capacity: env_parse("BACKBONE_PUBLISH_CAPACITY", DEFAULT_BACKBONE_PUBLISH_CAPACITY).max(1),
            publish_timeout: Duration::from_millis(
                env_parse("BACKBONE_PUBLISH_TIMEOUT_MS", DEFAULT_BACKBONE_PUBLISH_TIMEOUT_MS).max(1),
            ),
        };

        let connection = ConnectionConfig {
            outbound_capacity: env_parse("WS_OUTBOUND_CAPACITY", DEFAULT_WS_OUTBOUND_CAPACITY).max(1),
            ping_interval: Duration::from_secs(env_parse("WS_PING_INTERVAL_SECS", DEFAULT_WS_PING_INTERVAL_SECS)),
            pong_wait: Duration::from_secs(env_parse("WS_PONG_WAIT_SECS", DEFAULT_WS_PONG_WAIT_SECS).max(1)),
            write_timeout: Duration::from_secs(env_parse("WS_WRITE_TIMEOUT_SECS", DEFAULT_WS_WRITE_TIMEOUT_SECS).max(1)),
            max_message_bytes: env_parse("WS_MAX_MESSAGE_BYTES", DEFAULT_WS_MAX_MESSAGE_BYTES),
        }
        .normalized();

        Ok(Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            backbone,
            hub,
            connection,
        })
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
