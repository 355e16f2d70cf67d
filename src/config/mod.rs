pub mod rate_limit;
pub use rate_limit::{FailurePolicy, RateLimitConfig, RateLimitOptions, MESSAGE_WINDOW};

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("burst_factor must be a finite number >= 1, got {0}")]
    BurstFactor(f64),

    #[error("{field} must not be empty")]
    EmptyPrefix { field: &'static str },

    #[error("failed to read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rate_limit: RateLimitOptions,
}

/// HTTP / WebSocket server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Relay channel capacity; slow sockets beyond this lag and skip frames
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// How often the in-process store sweeps expired counters (seconds)
    #[serde(default = "default_purge_interval")]
    pub purge_interval_seconds: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_ws_path() -> String {
    "/api/ws".to_string()
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_purge_interval() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            ws_path: default_ws_path(),
            broadcast_capacity: default_broadcast_capacity(),
            purge_interval_seconds: default_purge_interval(),
        }
    }
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local counters and connection tracking
    #[default]
    Memory,
    /// Shared counters in Redis
    Redis,
}

/// Counter store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

fn default_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<GateConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    let config: GateConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })?;
    Ok(config)
}
