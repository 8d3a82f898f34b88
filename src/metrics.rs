//! Optional performance counters for the pool (feature `metrics`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Event counters for the control loop.
#[derive(Debug)]
pub struct Metrics {
    /// Worker threads successfully created.
    pub threads_created: AtomicU64,
    /// Creation attempts refused by the per-second rate cap.
    pub creations_throttled: AtomicU64,
    /// Times a worker parked.
    pub parks: AtomicU64,
    /// Parks that ended in a timeout (worker retired).
    pub park_timeouts: AtomicU64,
    /// Explicit unparks that woke a worker.
    pub unparks: AtomicU64,
    /// Hill-climbing updates that ran to completion.
    pub adjustments: AtomicU64,
    /// Forced concurrency increases by the starvation monitor.
    pub starvation_escalations: AtomicU64,
    /// When metrics collection started.
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            threads_created: AtomicU64::new(0),
            creations_throttled: AtomicU64::new(0),
            parks: AtomicU64::new(0),
            park_timeouts: AtomicU64::new(0),
            unparks: AtomicU64::new(0),
            adjustments: AtomicU64::new(0),
            starvation_escalations: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn bump(&self, field: impl Fn(&Self) -> &AtomicU64) {
        field(self).fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            threads_created: self.threads_created.load(Ordering::Relaxed),
            creations_throttled: self.creations_throttled.load(Ordering::Relaxed),
            parks: self.parks.load(Ordering::Relaxed),
            park_timeouts: self.park_timeouts.load(Ordering::Relaxed),
            unparks: self.unparks.load(Ordering::Relaxed),
            adjustments: self.adjustments.load(Ordering::Relaxed),
            starvation_escalations: self.starvation_escalations.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub threads_created: u64,
    pub creations_throttled: u64,
    pub parks: u64,
    pub park_timeouts: u64,
    pub unparks: u64,
    pub adjustments: u64,
    pub starvation_escalations: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Average thread creations per second since collection started.
    pub fn creations_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.threads_created as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }
}
