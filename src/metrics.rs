//! Control-plane metrics.
//!
//! Lightweight atomic counters and gauges, snapshot-able for the `?what=stats`
//! aggregation. There is deliberately no exporter here; the stats pipeline is
//! an external collaborator.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by a specific amount.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge that can move in both directions.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub const fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// The control-plane metric set of a single node.
#[derive(Debug, Default)]
pub struct ControlMetrics {
    /// Join/keepalive POSTs handled (primary only).
    pub post_count: Counter,
    /// Keepalives received.
    pub keepalive_count: Counter,
    /// Metasync batches sent.
    pub sync_count: Counter,
    /// Metasync deliveries that ultimately failed.
    pub sync_fail_count: Counter,
    /// Rebalance rounds started.
    pub reb_rounds: Counter,
    /// Objects transmitted during rebalance.
    pub reb_objs_tx: Counter,
    /// Bytes transmitted during rebalance.
    pub reb_bytes_tx: Counter,
    /// Objects received during rebalance.
    pub reb_objs_rx: Counter,
    /// Bytes received during rebalance.
    pub reb_bytes_rx: Counter,
    /// Current number of in-flight broadcast calls.
    pub bcast_inflight: Gauge,
}

/// Point-in-time copy of [`ControlMetrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub post_count: u64,
    pub keepalive_count: u64,
    pub sync_count: u64,
    pub sync_fail_count: u64,
    pub reb_rounds: u64,
    pub reb_objs_tx: u64,
    pub reb_bytes_tx: u64,
    pub reb_objs_rx: u64,
    pub reb_bytes_rx: u64,
}

impl ControlMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            post_count: self.post_count.get(),
            keepalive_count: self.keepalive_count.get(),
            sync_count: self.sync_count.get(),
            sync_fail_count: self.sync_fail_count.get(),
            reb_rounds: self.reb_rounds.get(),
            reb_objs_tx: self.reb_objs_tx.get(),
            reb_bytes_tx: self.reb_bytes_tx.get(),
            reb_objs_rx: self.reb_objs_rx.get(),
            reb_bytes_rx: self.reb_bytes_rx.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let c = Counter::new();
        c.inc();
        c.add(4);
        assert_eq!(c.get(), 5);

        let g = Gauge::new();
        g.inc();
        g.inc();
        g.dec();
        assert_eq!(g.get(), 1);
        g.set(-7);
        assert_eq!(g.get(), -7);
    }

    #[test]
    fn test_snapshot() {
        let m = ControlMetrics::new();
        m.reb_objs_tx.add(3);
        m.reb_bytes_tx.add(4096);
        let snap = m.snapshot();
        assert_eq!(snap.reb_objs_tx, 3);
        assert_eq!(snap.reb_bytes_tx, 4096);
        assert_eq!(snap.reb_objs_rx, 0);
    }
}
