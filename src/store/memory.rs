use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{ttl_millis, CounterStore, StoreError};
use crate::clock::Clock;

struct Entry {
    value: String,
    /// Epoch millis; `None` never expires
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }
}

/// Process-local counter store.
///
/// Expired entries are dropped lazily on access and in bulk by `purge_expired`.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_ms();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at_ms = self.clock.now_ms().saturating_add(ttl_millis(ttl));
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms: Some(expires_at_ms),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.clock.now_ms();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at_ms: None,
            });

        if entry.is_expired(now) {
            entry.value = "0".to_string();
            entry.expires_at_ms = None;
        }

        let next = entry
            .value
            .parse::<i64>()
            .ok()
            .and_then(|current| current.checked_add(1))
            .ok_or_else(|| StoreError::Corrupt {
                value: entry.value.clone(),
            })?;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at_ms = Some(now.saturating_add(ttl_millis(ttl)));
            }
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (MemoryStore::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (store, _clock) = store();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "7", Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let (store, clock) = store();
        store.set("k", "1", Duration::from_millis(500)).await.unwrap();

        clock.advance(Duration::from_millis(499));
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_millis(1));
        assert_eq!(store.get("k").await.unwrap(), None);
        // Lazily evicted on read
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_incr_missing_key_starts_at_one_without_expiry() {
        let (store, clock) = store();
        assert_eq!(store.incr("k").await.unwrap(), 1);
        assert_eq!(store.incr("k").await.unwrap(), 2);

        clock.advance(Duration::from_secs(3600));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_incr_keeps_existing_expiry() {
        let (store, clock) = store();
        store.set("k", "1", Duration::from_secs(10)).await.unwrap();

        clock.advance(Duration::from_secs(9));
        assert_eq!(store.incr("k").await.unwrap(), 2);

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_expired_key_restarts() {
        let (store, clock) = store();
        store.set("k", "41", Duration::from_secs(1)).await.unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.incr("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incr_non_numeric_is_corrupt() {
        let (store, _clock) = store();
        store.set("k", "abc", Duration::from_secs(1)).await.unwrap();

        let err = store.incr("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref value } if value == "abc"));
    }

    #[tokio::test]
    async fn test_expire_sets_ttl_on_existing_key_only() {
        let (store, clock) = store();
        store.incr("k").await.unwrap();
        store.expire("k", Duration::from_secs(5)).await.unwrap();
        store.expire("missing", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.get("missing").await.unwrap(), None);

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_huge_ttl_saturates() {
        let (store, clock) = store();
        store.set("k", "1", Duration::MAX).await.unwrap();
        store.incr("k").await.unwrap();
        store
            .expire("k", Duration::from_millis(u64::MAX))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_incr_at_max_is_corrupt() {
        let (store, _clock) = store();
        let max = i64::MAX.to_string();
        store.set("k", &max, Duration::from_secs(1)).await.unwrap();

        let err = store.incr("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref value } if *value == max));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store();
        store.set("short", "1", Duration::from_secs(1)).await.unwrap();
        store.set("long", "1", Duration::from_secs(60)).await.unwrap();
        store.incr("forever").await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 2);
    }
}
