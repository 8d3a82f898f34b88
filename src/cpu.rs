//! Global CPU utilization sampling for the starvation monitor.

use sysinfo::{CpuRefreshKind, RefreshKind, System};

/// Wraps a [`sysinfo::System`] configured for CPU-only refreshes.
///
/// Usage is computed between consecutive refreshes, so the first call after
/// construction reports the utilization since `new()`. The monitor samples on
/// its own cadence (hundreds of milliseconds), which is comfortably above
/// sysinfo's minimum update interval.
pub struct CpuSampler {
    system: System,
}

impl CpuSampler {
    pub fn new() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing().with_cpu_usage()),
        );
        system.refresh_cpu_usage();
        CpuSampler { system }
    }

    /// Returns the global CPU utilization since the previous sample, in
    /// whole percent.
    pub fn sample(&mut self) -> i32 {
        self.system.refresh_cpu_usage();
        self.system.global_cpu_usage().round() as i32
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        CpuSampler::new()
    }
}
