use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use super::ConfigError;

/// Length of the steady-state message counting window.
pub const MESSAGE_WINDOW: Duration = Duration::from_secs(60);

/// What a check answers when the counter store fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Allow the connection or message.
    #[default]
    FailOpen,
    /// Refuse the connection or message.
    FailClosed,
}

impl FailurePolicy {
    pub fn allows(self) -> bool {
        matches!(self, FailurePolicy::FailOpen)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::FailOpen => "fail_open",
            FailurePolicy::FailClosed => "fail_closed",
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" => Ok(FailurePolicy::FailOpen),
            "fail_closed" | "closed" => Ok(FailurePolicy::FailClosed),
            other => Err(format!("unknown failure policy '{}'", other)),
        }
    }
}

/// Partial limiter settings. Unset fields take the documented defaults.
///
/// This is the shape of the `[rate_limit]` config section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitOptions {
    pub max_connections_per_identity: Option<u64>,
    pub connection_window_ms: Option<u64>,
    pub max_messages_per_minute: Option<u64>,
    pub max_message_size_bytes: Option<usize>,
    pub burst_factor: Option<f64>,
    pub burst_duration_ms: Option<u64>,
    pub connection_key_prefix: Option<String>,
    pub message_key_prefix: Option<String>,
    pub failure_policy: Option<FailurePolicy>,
    pub store_timeout_ms: Option<u64>,
}

impl RateLimitOptions {
    /// Apply `WSGATE_*` env vars on top of these options. Unparsable values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply `WSGATE_*` overrides read through `lookup`.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parse_override(&lookup, "WSGATE_MAX_CONNECTIONS_PER_IDENTITY") {
            self.max_connections_per_identity = Some(v);
        }
        if let Some(v) = parse_override(&lookup, "WSGATE_CONNECTION_WINDOW_MS") {
            self.connection_window_ms = Some(v);
        }
        if let Some(v) = parse_override(&lookup, "WSGATE_MAX_MESSAGES_PER_MINUTE") {
            self.max_messages_per_minute = Some(v);
        }
        if let Some(v) = parse_override(&lookup, "WSGATE_MAX_MESSAGE_SIZE_BYTES") {
            self.max_message_size_bytes = Some(v);
        }
        if let Some(v) = parse_override(&lookup, "WSGATE_BURST_FACTOR") {
            self.burst_factor = Some(v);
        }
        if let Some(v) = parse_override(&lookup, "WSGATE_BURST_DURATION_MS") {
            self.burst_duration_ms = Some(v);
        }
        if let Some(v) = parse_override(&lookup, "WSGATE_FAILURE_POLICY") {
            self.failure_policy = Some(v);
        }
        if let Some(v) = parse_override(&lookup, "WSGATE_STORE_TIMEOUT_MS") {
            self.store_timeout_ms = Some(v);
        }
        self
    }
}

fn parse_override<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = lookup(key)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, error = %e, "Ignoring invalid environment override");
            None
        }
    }
}

/// Validated, immutable limiter thresholds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitConfig {
    pub max_connections_per_identity: u64,
    pub connection_window_ms: u64,
    pub max_messages_per_minute: u64,
    pub max_message_size_bytes: usize,
    pub burst_factor: f64,
    pub burst_duration_ms: u64,
    pub connection_key_prefix: String,
    pub message_key_prefix: String,
    pub failure_policy: FailurePolicy,
    pub store_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_connections_per_identity: 10,
            connection_window_ms: 60_000,
            max_messages_per_minute: 120,
            max_message_size_bytes: 8_192,
            burst_factor: 2.0,
            burst_duration_ms: 5_000,
            connection_key_prefix: "ws:conn:".to_string(),
            message_key_prefix: "ws:msg:".to_string(),
            failure_policy: FailurePolicy::FailOpen,
            store_timeout_ms: 250,
        }
    }
}

impl RateLimitConfig {
    /// Merge `options` over the defaults and validate the result.
    pub fn from_options(options: RateLimitOptions) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_connections_per_identity: options
                .max_connections_per_identity
                .unwrap_or(defaults.max_connections_per_identity),
            connection_window_ms: options
                .connection_window_ms
                .unwrap_or(defaults.connection_window_ms),
            max_messages_per_minute: options
                .max_messages_per_minute
                .unwrap_or(defaults.max_messages_per_minute),
            max_message_size_bytes: options
                .max_message_size_bytes
                .unwrap_or(defaults.max_message_size_bytes),
            burst_factor: options.burst_factor.unwrap_or(defaults.burst_factor),
            burst_duration_ms: options
                .burst_duration_ms
                .unwrap_or(defaults.burst_duration_ms),
            connection_key_prefix: options
                .connection_key_prefix
                .unwrap_or(defaults.connection_key_prefix),
            message_key_prefix: options
                .message_key_prefix
                .unwrap_or(defaults.message_key_prefix),
            failure_policy: options.failure_policy.unwrap_or(defaults.failure_policy),
            store_timeout_ms: options
                .store_timeout_ms
                .unwrap_or(defaults.store_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            (
                "max_connections_per_identity",
                self.max_connections_per_identity,
            ),
            ("connection_window_ms", self.connection_window_ms),
            ("max_messages_per_minute", self.max_messages_per_minute),
            ("max_message_size_bytes", self.max_message_size_bytes as u64),
            ("burst_duration_ms", self.burst_duration_ms),
            ("store_timeout_ms", self.store_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        if !self.burst_factor.is_finite() || self.burst_factor < 1.0 {
            return Err(ConfigError::BurstFactor(self.burst_factor));
        }

        if self.connection_key_prefix.is_empty() {
            return Err(ConfigError::EmptyPrefix {
                field: "connection_key_prefix",
            });
        }
        if self.message_key_prefix.is_empty() {
            return Err(ConfigError::EmptyPrefix {
                field: "message_key_prefix",
            });
        }

        Ok(())
    }

    /// Message ceiling while a burst is engaged: `floor(max_messages_per_minute * burst_factor)`.
    pub fn burst_ceiling(&self) -> u64 {
        (self.max_messages_per_minute as f64 * self.burst_factor).floor() as u64
    }

    /// Extra messages a burst may add on top of the steady-state budget.
    pub fn burst_budget(&self) -> u64 {
        self.burst_ceiling()
            .saturating_sub(self.max_messages_per_minute)
    }

    pub fn connection_window(&self) -> Duration {
        Duration::from_millis(self.connection_window_ms)
    }

    pub fn burst_duration(&self) -> Duration {
        Duration::from_millis(self.burst_duration_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}
