//! In-memory metrics for the processing plane.
//!
//! Lock-free atomics, single global instance; snapshots go out through the
//! control surface.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance.
pub static METRICS: EngineMetrics = EngineMetrics::new();

pub struct EngineMetrics {
    // Pipeline
    pub messages_received: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub batches_processed: AtomicU64,
    pub values_processed: AtomicU64,

    // Virtual points
    pub vp_evaluations: AtomicU64,
    pub vp_cache_hits: AtomicU64,
    pub vp_errors: AtomicU64,

    // Sinks
    pub publish_failures: AtomicU64,
    pub cache_write_failures: AtomicU64,
    pub timeseries_write_failures: AtomicU64,
    pub persist_failures: AtomicU64,

    // Timing (cumulative microseconds)
    pub batch_time_us: AtomicU64,
}

impl EngineMetrics {
    pub const fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            batches_processed: AtomicU64::new(0),
            values_processed: AtomicU64::new(0),
            vp_evaluations: AtomicU64::new(0),
            vp_cache_hits: AtomicU64::new(0),
            vp_errors: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            cache_write_failures: AtomicU64::new(0),
            timeseries_write_failures: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            batch_time_us: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            values_processed: self.values_processed.load(Ordering::Relaxed),
            vp_evaluations: self.vp_evaluations.load(Ordering::Relaxed),
            vp_cache_hits: self.vp_cache_hits.load(Ordering::Relaxed),
            vp_errors: self.vp_errors.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            cache_write_failures: self.cache_write_failures.load(Ordering::Relaxed),
            timeseries_write_failures: self.timeseries_write_failures.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            batch_time_us: self.batch_time_us.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy for the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub batches_processed: u64,
    pub values_processed: u64,
    pub vp_evaluations: u64,
    pub vp_cache_hits: u64,
    pub vp_errors: u64,
    pub publish_failures: u64,
    pub cache_write_failures: u64,
    pub timeseries_write_failures: u64,
    pub persist_failures: u64,
    pub batch_time_us: u64,
}
