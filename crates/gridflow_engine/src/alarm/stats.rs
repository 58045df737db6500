//! Alarm engine counters.

use gridflow_protocol::Severity;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters for the alarm engine. Lock-free; snapshotted for the
/// control surface.
#[derive(Default)]
pub struct AlarmStats {
    pub evaluations: AtomicU64,
    pub triggered: AtomicU64,
    pub cleared: AtomicU64,
    pub acknowledged: AtomicU64,
    pub suppressed: AtomicU64,
    pub errors: AtomicU64,
    pub eval_time_us: AtomicU64,
    by_severity: [AtomicU64; 5],
}

impl AlarmStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_severity(&self, severity: Severity) {
        self.by_severity[severity_slot(severity)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AlarmStatsSnapshot {
        let triggered = self.triggered.load(Ordering::Relaxed);
        let evaluations = self.evaluations.load(Ordering::Relaxed);
        let eval_time_us = self.eval_time_us.load(Ordering::Relaxed);
        AlarmStatsSnapshot {
            evaluations,
            triggered,
            cleared: self.cleared.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            avg_eval_time_us: if evaluations > 0 { eval_time_us / evaluations } else { 0 },
            by_severity: [
                self.by_severity[0].load(Ordering::Relaxed),
                self.by_severity[1].load(Ordering::Relaxed),
                self.by_severity[2].load(Ordering::Relaxed),
                self.by_severity[3].load(Ordering::Relaxed),
                self.by_severity[4].load(Ordering::Relaxed),
            ],
        }
    }
}

fn severity_slot(severity: Severity) -> usize {
    match severity {
        Severity::Critical => 0,
        Severity::High => 1,
        Severity::Medium => 2,
        Severity::Low => 3,
        Severity::Info => 4,
    }
}

/// Point-in-time counters. `by_severity` is ordered critical..info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AlarmStatsSnapshot {
    pub evaluations: u64,
    pub triggered: u64,
    pub cleared: u64,
    pub acknowledged: u64,
    pub suppressed: u64,
    pub errors: u64,
    pub avg_eval_time_us: u64,
    pub by_severity: [u64; 5],
}
