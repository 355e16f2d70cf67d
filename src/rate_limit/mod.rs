// Connection admission and message throughput limits for the WebSocket gateway.
//
// Counters live in a `CounterStore`; the limiter itself only holds config.
// Connection counters are per identity and expire with the connection window.
// Message counters are per connection: a 60 s steady-state window plus a
// burst allowance with its own, independent expiry.

mod tracker;
mod violation;


pub use tracker::ConnectionTracker;
pub use violation::{IdentityHasher, Violation};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::clock::Clock;
use crate::config::{RateLimitConfig, MESSAGE_WINDOW};
use crate::store::{CounterStore, MemoryStore, StoreError};
use violation::{log_rejection, Rejection};

/// How connection admission is decided.
enum Admission {
    /// Per-identity counter in the store; never decremented on close
    Counted,
    /// Live connection sets held in this process
    Tracked(ConnectionTracker),
}

/// Store keys for one connection's message counters.
struct MessageKeys {
    count: String,
    window: String,
    burst: String,
}

impl MessageKeys {
    fn new(prefix: &str, connection_id: &str) -> Self {
        let count = format!("{}{}", prefix, connection_id);
        Self {
            window: format!("{}:window", count),
            burst: format!("{}:burst", count),
            count,
        }
    }
}

/// Rate limiter for connection admission and message throughput.
///
/// Every public check resolves to a decision: store failures are logged and
/// answered by the configured `FailurePolicy`, never returned to the caller.
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    admission: Admission,
    hasher: IdentityHasher,
}

impl RateLimiter {
    /// Limiter whose connection and message counters all live in `store`.
    pub fn with_store(
        config: RateLimitConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            admission: Admission::Counted,
            hasher: IdentityHasher::random(),
        }
    }

    /// Process-local limiter: admission by live connection sets, message
    /// counters in `store`.
    pub fn in_process(
        config: RateLimitConfig,
        store: Arc<MemoryStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            admission: Admission::Tracked(ConnectionTracker::new()),
            hasher: IdentityHasher::random(),
        }
    }

    /// Replace the random per-process salt used to hash identities in logs.
    pub fn with_hasher(mut self, hasher: IdentityHasher) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// "counted" or "tracked"
    pub fn admission_mode(&self) -> &'static str {
        match self.admission {
            Admission::Counted => "counted",
            Admission::Tracked(_) => "tracked",
        }
    }

    pub fn hash_identity(&self, identity: &str) -> String {
        self.hasher.hash(identity)
    }

    /// Should a new connection from `identity` be accepted?
    pub async fn can_connect(&self, identity: &str) -> bool {
        self.check_connection(identity).await.is_ok()
    }

    /// Like `can_connect`, but says which limit refused.
    pub async fn check_connection(&self, identity: &str) -> Result<(), Violation> {
        let decision = match &self.admission {
            Admission::Tracked(tracker) => {
                Ok(tracker.has_capacity(identity, self.config.max_connections_per_identity))
            }
            Admission::Counted => self.admit_counted(identity).await,
        };

        let allowed = match decision {
            Ok(allowed) => allowed,
            Err(e) => {
                return self.on_store_failure("can_connect", identity, &e, Violation::Connection)
            }
        };

        if allowed {
            Ok(())
        } else {
            self.reject(Rejection {
                violation: Violation::Connection,
                identity,
                connection_id: None,
                message_size: None,
            })
        }
    }

    /// Should a message of `size` bytes on `connection_id` be accepted?
    pub async fn can_send_message(&self, identity: &str, connection_id: &str, size: usize) -> bool {
        self.check_message(identity, connection_id, size)
            .await
            .is_ok()
    }

    /// Like `can_send_message`, but says which limit refused.
    pub async fn check_message(
        &self,
        identity: &str,
        connection_id: &str,
        size: usize,
    ) -> Result<(), Violation> {
        // Size check never touches counters
        if size > self.config.max_message_size_bytes {
            return self.reject(Rejection {
                violation: Violation::MessageSize,
                identity,
                connection_id: Some(connection_id),
                message_size: Some(size),
            });
        }

        match self.admit_message(connection_id).await {
            Ok(true) => Ok(()),
            Ok(false) => self.reject(Rejection {
                violation: Violation::MessageRate,
                identity,
                connection_id: Some(connection_id),
                message_size: Some(size),
            }),
            Err(e) => {
                self.on_store_failure("can_send_message", identity, &e, Violation::MessageRate)
            }
        }
    }

    /// Admit `connection_id` for `identity` at handshake time.
    ///
    /// In-process tracking reserves the slot atomically, and it stays held
    /// until `unregister_connection`. Store-backed admission is the same as
    /// `check_connection`.
    pub async fn admit_connection(
        &self,
        identity: &str,
        connection_id: &str,
    ) -> Result<(), Violation> {
        let Admission::Tracked(tracker) = &self.admission else {
            return self.check_connection(identity).await;
        };

        let max = self.config.max_connections_per_identity;
        if tracker.try_reserve(identity, connection_id, max) {
            debug!(connection_id, live = tracker.count(identity), "Connection slot reserved");
            return Ok(());
        }

        self.reject(Rejection {
            violation: Violation::Connection,
            identity,
            connection_id: Some(connection_id),
            message_size: None,
        })
    }

    /// Record an accepted connection. Only affects in-process tracking.
    pub fn register_connection(&self, identity: &str, connection_id: &str) {
        if let Admission::Tracked(tracker) = &self.admission {
            tracker.register(identity, connection_id);
            debug!(connection_id, live = tracker.count(identity), "Connection registered");
        }
    }

    /// Record a closed connection. Only affects in-process tracking.
    pub fn unregister_connection(&self, identity: &str, connection_id: &str) {
        if let Admission::Tracked(tracker) = &self.admission {
            tracker.unregister(identity, connection_id);
            debug!(connection_id, live = tracker.count(identity), "Connection unregistered");
        }
    }

    async fn admit_counted(&self, identity: &str) -> Result<bool, StoreError> {
        let key = format!("{}{}", self.config.connection_key_prefix, identity);
        let window = self.config.connection_window();

        let Some(raw) = self.get(&key).await? else {
            self.set(&key, "1", window).await?;
            return Ok(true);
        };

        if parse_counter(&raw)? >= self.config.max_connections_per_identity {
            return Ok(false);
        }

        // A counter that lapsed between GET and INCR comes back without a TTL
        if self.incr(&key).await? == 1 {
            self.expire(&key, window).await?;
        }
        Ok(true)
    }

    async fn admit_message(&self, connection_id: &str) -> Result<bool, StoreError> {
        let keys = MessageKeys::new(&self.config.message_key_prefix, connection_id);
        let now = self.clock.now_ms();

        let window_open = match self.get(&keys.window).await? {
            Some(raw) => now < parse_millis(&raw)?,
            None => false,
        };

        if !window_open {
            // Fresh window; the burst counter keeps its own expiry
            let expires_at = now.saturating_add(MESSAGE_WINDOW.as_millis() as u64);
            self.set(&keys.count, "1", MESSAGE_WINDOW).await?;
            self.set(&keys.window, &expires_at.to_string(), MESSAGE_WINDOW)
                .await?;
            return Ok(true);
        }

        let normal = self.read_counter(&keys.count).await?;
        if normal < self.config.max_messages_per_minute {
            self.incr(&keys.count).await?;
            return Ok(true);
        }

        if normal >= self.config.burst_ceiling() {
            return Ok(false);
        }

        let burst = self.read_counter(&keys.burst).await?;
        if burst >= self.config.burst_budget() {
            return Ok(false);
        }

        if self.incr(&keys.burst).await? == 1 {
            self.expire(&keys.burst, self.config.burst_duration()).await?;
        }
        self.incr(&keys.count).await?;
        Ok(true)
    }

    fn reject(&self, rejection: Rejection<'_>) -> Result<(), Violation> {
        log_rejection(&self.config, &self.hasher, &rejection);
        Err(rejection.violation)
    }

    fn on_store_failure(
        &self,
        operation: &'static str,
        identity: &str,
        err: &StoreError,
        refused_as: Violation,
    ) -> Result<(), Violation> {
        let policy = self.config.failure_policy;
        error!(
            operation,
            identity_hash = %self.hasher.hash(identity),
            backend = self.store.backend_name(),
            policy = policy.as_str(),
            error = %err,
            "Counter store failure"
        );

        if policy.allows() {
            Ok(())
        } else {
            Err(refused_as)
        }
    }

    async fn read_counter(&self, key: &str) -> Result<u64, StoreError> {
        match self.get(key).await? {
            Some(raw) => parse_counter(&raw),
            None => Ok(0),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.bounded(self.store.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.bounded(self.store.set(key, value, ttl)).await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.bounded(self.store.incr(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.bounded(self.store.expire(key, ttl)).await
    }

    /// Apply the store timeout to one store call.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let limit = self.config.store_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(limit)),
        }
    }
}

fn parse_counter(raw: &str) -> Result<u64, StoreError> {
    parse_u64(raw)
}

/// Window marker: epoch millis at which the current window closes
fn parse_millis(raw: &str) -> Result<u64, StoreError> {
    parse_u64(raw)
}

fn parse_u64(raw: &str) -> Result<u64, StoreError> {
    raw.trim().parse::<u64>().map_err(|_| StoreError::Corrupt {
        value: raw.to_string(),
    })
}
