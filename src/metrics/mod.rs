//! The `metrics` module holds the pipeline's process-local counters.
//!
//! Monitoring itself lives outside the core: these counters are the emission
//! side only, read by whatever collector wraps the process. Recording an
//! observation never affects a pipeline outcome.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for every observable pipeline event.
#[derive(Debug, Default)]
pub struct Metrics {
    pub publish_attempts: AtomicU64,
    pub publish_success: AtomicU64,
    pub publish_failure: AtomicU64,
    pub delivery_attempts: AtomicU64,
    pub deliveries_succeeded: AtomicU64,
    pub deliveries_failed: AtomicU64,
    pub duplicate_deliveries: AtomicU64,
    pub dlq_enqueued: AtomicU64,
    pub dlq_expired: AtomicU64,
    pub audit_write_failures: AtomicU64,
}

/// Point-in-time copy of the counters, for logging and assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub publish_attempts: u64,
    pub publish_success: u64,
    pub publish_failure: u64,
    pub delivery_attempts: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_failed: u64,
    pub duplicate_deliveries: u64,
    pub dlq_enqueued: u64,
    pub dlq_expired: u64,
    pub audit_write_failures: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            publish_attempts: self.publish_attempts.load(Ordering::Relaxed),
            publish_success: self.publish_success.load(Ordering::Relaxed),
            publish_failure: self.publish_failure.load(Ordering::Relaxed),
            delivery_attempts: self.delivery_attempts.load(Ordering::Relaxed),
            deliveries_succeeded: self.deliveries_succeeded.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            duplicate_deliveries: self.duplicate_deliveries.load(Ordering::Relaxed),
            dlq_enqueued: self.dlq_enqueued.load(Ordering::Relaxed),
            dlq_expired: self.dlq_expired.load(Ordering::Relaxed),
            audit_write_failures: self.audit_write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Increments a counter.
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
