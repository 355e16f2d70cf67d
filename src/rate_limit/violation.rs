use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::RateLimitConfig;

/// Which limit refused the connection or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    Connection,
    MessageRate,
    MessageSize,
}

impl Violation {
    pub fn as_str(self) -> &'static str {
        match self {
            Violation::Connection => "connection",
            Violation::MessageRate => "message_rate",
            Violation::MessageSize => "message_size",
        }
    }
}

/// Salted one-way hash so identities can be correlated across log lines
/// without ever being written out.
pub struct IdentityHasher {
    salt: [u8; 16],
}

impl IdentityHasher {
    /// Hasher with a fresh random salt (per process)
    pub fn random() -> Self {
        Self {
            salt: rand::thread_rng().gen(),
        }
    }

    pub fn with_salt(salt: [u8; 16]) -> Self {
        Self { salt }
    }

    pub fn hash(&self, identity: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt);
        hasher.update(identity.as_bytes());
        let digest = hasher.finalize();
        URL_SAFE_NO_PAD.encode(&digest[..12])
    }
}

/// One refused connection or message.
pub(crate) struct Rejection<'a> {
    pub violation: Violation,
    pub identity: &'a str,
    pub connection_id: Option<&'a str>,
    pub message_size: Option<usize>,
}

/// Emit the structured warn record for a rejection, with every limit in effect.
pub(crate) fn log_rejection(
    config: &RateLimitConfig,
    hasher: &IdentityHasher,
    rejection: &Rejection<'_>,
) {
    warn!(
        violation = rejection.violation.as_str(),
        identity_hash = %hasher.hash(rejection.identity),
        connection_id = rejection.connection_id,
        message_size = rejection.message_size,
        max_connections_per_identity = config.max_connections_per_identity,
        connection_window_ms = config.connection_window_ms,
        max_messages_per_minute = config.max_messages_per_minute,
        max_message_size_bytes = config.max_message_size_bytes,
        burst_factor = config.burst_factor,
        burst_duration_ms = config.burst_duration_ms,
        "Rate limit exceeded"
    );
}
