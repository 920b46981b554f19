//! Observability hooks (C8): counters, gauges and histograms the router
//! exposes to an external metrics collaborator. `MetricsSink` is the
//! abstract interface; `AtomicMetrics` is the lock-free reference
//! implementation used by the relay binary and by tests.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A crude running summary, good enough for a JSON snapshot endpoint.
/// Not a full histogram — no buckets, no quantiles.
#[derive(Debug, Default)]
pub struct Summary {
    count: AtomicU64,
    sum_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl Summary {
    fn observe(&self, duration: std::time::Duration) {
        let micros = duration.as_micros().min(u128::from(u64::MAX)) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SummarySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_micros.load(Ordering::Relaxed);
        SummarySnapshot {
            count,
            mean_micros: if count == 0 { 0 } else { sum / count },
            max_micros: self.max_micros.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct SummarySnapshot {
    pub count: u64,
    pub mean_micros: u64,
    pub max_micros: u64,
}

/// Abstract sink the router reports to. Implemented by `AtomicMetrics`;
/// a no-op or a remote-exporting implementation can substitute in tests
/// or in a future deployment.
pub trait MetricsSink: Send + Sync {
    fn message_routed(&self, bytes: usize);
    fn message_queued(&self, bytes: usize);
    fn message_rejected(&self);
    fn message_expired(&self);
    fn bytes_out(&self, bytes: usize);
    fn wallet_registered(&self);
    fn wallet_unregistered(&self);
    fn queue_depth_changed(&self, delta: i64);
    fn connection_opened(&self);
    fn connection_closed(&self, lifetime: std::time::Duration);
    fn routing_latency(&self, latency: std::time::Duration);
}

/// Lock-free reference implementation of [`MetricsSink`], snapshotted as
/// JSON by the `--metrics-listen` endpoint.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    pub messages_routed: AtomicU64,
    pub messages_queued: AtomicU64,
    pub messages_rejected: AtomicU64,
    pub messages_expired: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub registered_wallets: AtomicI64,
    pub queued_entries: AtomicI64,
    pub active_connections: AtomicI64,
    pub routing_latency: Summary,
    pub connection_lifetime: Summary,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            messages_queued: self.messages_queued.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            messages_expired: self.messages_expired.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            registered_wallets: self.registered_wallets.load(Ordering::Relaxed),
            queued_entries: self.queued_entries.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            routing_latency: self.routing_latency.snapshot(),
            connection_lifetime: self.connection_lifetime.snapshot(),
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct MetricsSnapshot {
    pub messages_routed: u64,
    pub messages_queued: u64,
    pub messages_rejected: u64,
    pub messages_expired: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub registered_wallets: i64,
    pub queued_entries: i64,
    pub active_connections: i64,
    pub routing_latency: SummarySnapshot,
    pub connection_lifetime: SummarySnapshot,
}

impl MetricsSink for AtomicMetrics {
    fn message_routed(&self, bytes: usize) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn message_queued(&self, bytes: usize) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn message_expired(&self) {
        self.messages_expired.fetch_add(1, Ordering::Relaxed);
    }

    fn bytes_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn wallet_registered(&self) {
        self.registered_wallets.fetch_add(1, Ordering::Relaxed);
    }

    fn wallet_unregistered(&self) {
        self.registered_wallets.fetch_sub(1, Ordering::Relaxed);
    }

    fn queue_depth_changed(&self, delta: i64) {
        self.queued_entries.fetch_add(delta, Ordering::Relaxed);
    }

    fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self, lifetime: std::time::Duration) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.connection_lifetime.observe(lifetime);
    }

    fn routing_latency(&self, latency: std::time::Duration) {
        self.routing_latency.observe(latency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = AtomicMetrics::new();
        m.message_routed(100);
        m.message_routed(50);
        m.message_queued(10);
        m.message_rejected();
        let snap = m.snapshot();
        assert_eq!(snap.messages_routed, 2);
        assert_eq!(snap.messages_queued, 1);
        assert_eq!(snap.messages_rejected, 1);
        assert_eq!(snap.bytes_in, 160);
    }

    #[test]
    fn gauges_move_with_register_and_unregister() {
        let m = AtomicMetrics::new();
        m.wallet_registered();
        m.wallet_registered();
        m.wallet_unregistered();
        assert_eq!(m.snapshot().registered_wallets, 1);
    }

    #[test]
    fn latency_summary_tracks_max_and_mean() {
        let m = AtomicMetrics::new();
        m.routing_latency(std::time::Duration::from_micros(10));
        m.routing_latency(std::time::Duration::from_micros(30));
        let snap = m.snapshot();
        assert_eq!(snap.routing_latency.count, 2);
        assert_eq!(snap.routing_latency.max_micros, 30);
        assert_eq!(snap.routing_latency.mean_micros, 20);
    }
}
