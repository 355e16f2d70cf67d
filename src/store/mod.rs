//! Counter stores backing the rate limiter.
//!
//! The limiter needs four primitives from a store: `get`, `set` with a TTL,
//! atomic `incr`, and `expire`. Two backends implement them:
//!
//! - **Memory**: process-local `DashMap` with clock-driven expiry
//! - **Redis**: shared counters for multi-instance deployments

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Counter store failures. The limiter resolves all of them through its failure policy.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),

    /// Carries no key: counter keys embed client identities.
    #[error("counter holds a non-numeric value: {value:?}")]
    Corrupt { value: String },
}

/// Key-value store with TTLs and atomic increment.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value of `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Overwrite `key` with `value`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Atomically add one to `key` and return the new value.
    ///
    /// A missing key starts at 0 and gets no expiry; an existing expiry is kept.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Reset the expiry of an existing `key`. Missing keys are left alone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Backend name for logs
    fn backend_name(&self) -> &'static str;
}

pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
