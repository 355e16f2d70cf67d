use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for gateway admission and relay activity
#[derive(Default)]
pub struct GatewayMetrics {
    connections_open: AtomicU64,
    connections_admitted: AtomicU64,
    connections_refused: AtomicU64,
    messages_relayed: AtomicU64,
    messages_rejected: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_admitted(&self) {
        self.connections_admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    /// Socket upgraded and running
    pub fn connection_opened(&self) {
        self.connections_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Never wraps below zero
        let _ = self
            .connections_open
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_message_relayed(&self) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_open: self.connections_open.load(Ordering::Relaxed),
            connections_admitted: self.connections_admitted.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_open: u64,
    pub connections_admitted: u64,
    pub connections_refused: u64,
    pub messages_relayed: u64,
    pub messages_rejected: u64,
}
