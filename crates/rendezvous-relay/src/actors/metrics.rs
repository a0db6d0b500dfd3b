//! Relay metrics.
//!
//! Counters are kept in atomics so health/status handlers can snapshot them
//! without touching the dispatcher, and mirrored to the `metrics` facade
//! (exported in Prometheus format by `main`) with the `relay_` prefix.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared relay metrics.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    active_sessions: AtomicUsize,
    messages_routed: AtomicU64,
    messages_dropped: AtomicU64,
    rendezvous_established: AtomicU64,
    joins_rejected: AtomicU64,
    joins_timed_out: AtomicU64,
}

/// Point-in-time copy of the relay counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: usize,
    pub messages_routed: u64,
    pub messages_dropped: u64,
    pub rendezvous_established: u64,
    pub joins_rejected: u64,
    pub joins_timed_out: u64,
}

impl RelayMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the current registry size.
    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.store(count, Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("relay_active_sessions").set(count as f64);
    }

    /// Record a payload forwarded to a recipient.
    pub fn record_message_routed(&self) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_messages_routed_total").increment(1);
    }

    /// Record a message dropped (unknown identity or stale handle).
    pub fn record_message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_messages_dropped_total").increment(1);
    }

    /// Record a completed rendezvous (both edges created).
    pub fn record_rendezvous(&self) {
        self.rendezvous_established.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_rendezvous_established_total").increment(1);
    }

    /// Record a join rejected by the password gate.
    pub fn record_join_rejected(&self) {
        self.joins_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_joins_rejected_total").increment(1);
    }

    /// Record a pending join that exhausted its retry budget.
    pub fn record_join_timed_out(&self) {
        self.joins_timed_out.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_joins_timed_out_total").increment(1);
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            rendezvous_established: self.rendezvous_established.load(Ordering::Relaxed),
            joins_rejected: self.joins_rejected.load(Ordering::Relaxed),
            joins_timed_out: self.joins_timed_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_recorded_values() {
        let metrics = RelayMetrics::new();

        metrics.set_active_sessions(3);
        metrics.record_message_routed();
        metrics.record_message_routed();
        metrics.record_message_dropped();
        metrics.record_rendezvous();
        metrics.record_join_rejected();
        metrics.record_join_timed_out();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_sessions, 3);
        assert_eq!(snapshot.messages_routed, 2);
        assert_eq!(snapshot.messages_dropped, 1);
        assert_eq!(snapshot.rendezvous_established, 1);
        assert_eq!(snapshot.joins_rejected, 1);
        assert_eq!(snapshot.joins_timed_out, 1);
    }

    #[test]
    fn test_fresh_metrics_are_zero() {
        let snapshot = RelayMetrics::new().snapshot();
        assert_eq!(snapshot.active_sessions, 0);
        assert_eq!(snapshot.messages_routed, 0);
        assert_eq!(snapshot.messages_dropped, 0);
    }
}
