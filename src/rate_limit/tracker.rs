use dashmap::DashMap;
use std::collections::HashSet;

/// In-process record of live connections per identity.
///
/// Used for admission when no shared store is configured. Unlike the store
/// counters, entries leave as soon as their connection is unregistered.
#[derive(Default)]
pub struct ConnectionTracker {
    connections: DashMap<String, HashSet<String>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while `identity` holds fewer than `max` live connections
    pub fn has_capacity(&self, identity: &str, max: u64) -> bool {
        (self.count(identity) as u64) < max
    }

    /// Add `connection_id` to `identity`'s set if it is below `max`.
    ///
    /// Check and insert happen under one shard lock, so parallel handshakes
    /// cannot overshoot `max`. Reserving an id already held succeeds.
    pub fn try_reserve(&self, identity: &str, connection_id: &str, max: u64) -> bool {
        let mut set = self.connections.entry(identity.to_string()).or_default();
        if set.contains(connection_id) {
            return true;
        }
        if set.len() as u64 >= max {
            return false;
        }
        set.insert(connection_id.to_string());
        true
    }

    pub fn register(&self, identity: &str, connection_id: &str) {
        self.connections
            .entry(identity.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    pub fn unregister(&self, identity: &str, connection_id: &str) {
        if let Some(mut set) = self.connections.get_mut(identity) {
            set.remove(connection_id);
        }
        self.connections.remove_if(identity, |_, set| set.is_empty());
    }

    /// Live connections for one identity
    pub fn count(&self, identity: &str) -> usize {
        self.connections.get(identity).map_or(0, |set| set.len())
    }

    /// Live connections across all identities
    pub fn total(&self) -> usize {
        self.connections.iter().map(|set| set.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let tracker = ConnectionTracker::new();
        tracker.register("a", "c1");
        tracker.register("a", "c2");
        tracker.register("b", "c3");
        assert_eq!(tracker.count("a"), 2);
        assert_eq!(tracker.total(), 3);

        tracker.unregister("a", "c1");
        assert_eq!(tracker.count("a"), 1);

        tracker.unregister("a", "c2");
        assert_eq!(tracker.count("a"), 0);
        assert_eq!(tracker.total(), 1);
    }

    #[test]
    fn test_duplicate_register_counts_once() {
        let tracker = ConnectionTracker::new();
        tracker.register("a", "c1");
        tracker.register("a", "c1");
        assert_eq!(tracker.count("a"), 1);
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let tracker = ConnectionTracker::new();
        tracker.unregister("nobody", "c1");
        assert_eq!(tracker.total(), 0);
    }

    #[test]
    fn test_capacity() {
        let tracker = ConnectionTracker::new();
        assert!(tracker.has_capacity("a", 1));
        tracker.register("a", "c1");
        assert!(!tracker.has_capacity("a", 1));
        assert!(tracker.has_capacity("a", 2));
    }

    #[test]
    fn test_try_reserve_respects_max() {
        let tracker = ConnectionTracker::new();
        assert!(tracker.try_reserve("a", "c1", 2));
        assert!(tracker.try_reserve("a", "c2", 2));
        assert!(!tracker.try_reserve("a", "c3", 2));
        // Already held
        assert!(tracker.try_reserve("a", "c1", 2));
        assert_eq!(tracker.count("a"), 2);

        tracker.unregister("a", "c1");
        assert!(tracker.try_reserve("a", "c3", 2));
    }

    #[test]
    fn test_try_reserve_across_threads() {
        let tracker = ConnectionTracker::new();
        let reserved = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for i in 0..16 {
                let tracker = &tracker;
                let reserved = &reserved;
                scope.spawn(move || {
                    if tracker.try_reserve("a", &format!("c{}", i), 3) {
                        reserved.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(reserved.into_inner(), 3);
        assert_eq!(tracker.count("a"), 3);
    }
}
