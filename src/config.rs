//! Pool and controller configuration.
//!
//! Every tuning constant of the control loop is surfaced here with the
//! defaults the algorithm was tuned with. The defaults are sensible for
//! general workloads; tests shrink the time-based knobs to keep runtimes
//! short.

use serde::{Deserialize, Serialize};
use std::thread;

/// Environment variable holding the threads-per-core multiplier used to
/// derive the default minimum thread count.
pub const THREADS_PER_CPU_ENV: &str = "AUTOPOOL_THREADS_PER_CPU";

/// Largest value any packed counter field may reach. Limits derived or
/// configured above this are clamped.
pub const MAX_POSSIBLE_THREADS: u16 = i16::MAX as u16;

/// Tuning constants for the hill-climbing controller.
///
/// The frequency-domain analysis only works when `wave_period ≥ 2` and the
/// retained history (`wave_period * wave_history_size`) covers several full
/// periods; the defaults retain 32 samples for a period-4 wave.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HillClimbingConfig {
    /// Length, in samples, of the deliberate thread-count square wave.
    pub wave_period: u32,
    /// Number of full wave periods of history to retain.
    pub wave_history_size: u32,
    /// The "cost" of a thread: 0 drives for raw throughput regardless of
    /// thread count, higher values bias against more threads.
    pub bias: f64,
    /// Required ratio of thread-wave amplitude to throughput noise before a
    /// measurement is trusted at full confidence.
    pub target_signal_to_noise_ratio: f64,
    /// Exponential smoothing factor for the throughput-noise moving average.
    pub error_smoothing_factor: f64,
    /// Scale applied when deriving the next wave magnitude from the control
    /// setting and measured noise.
    pub wave_magnitude_multiplier: f64,
    /// Upper bound on the square-wave amplitude, in threads.
    pub max_wave_magnitude: u32,
    /// Upper bound on control-setting movement per second of sample time.
    pub max_change_per_second: f64,
    /// Upper bound on control-setting movement in a single update.
    pub max_change_per_sample: f64,
    /// Largest tolerated relative completion-count error before a sample is
    /// carried forward instead of consumed.
    pub max_sample_error: f64,
    /// Bounds for the randomized interval between controller updates.
    pub sample_interval_low_ms: u32,
    pub sample_interval_high_ms: u32,
    /// Gain exponent: 1.0 is linear, higher values enhance large moves and
    /// damp small ones.
    pub gain_exponent: f64,
}

impl Default for HillClimbingConfig {
    fn default() -> Self {
        HillClimbingConfig {
            wave_period: 4,
            wave_history_size: 8,
            bias: 0.15,
            target_signal_to_noise_ratio: 3.0,
            error_smoothing_factor: 0.01,
            wave_magnitude_multiplier: 1.0,
            max_wave_magnitude: 20,
            max_change_per_second: 4.0,
            max_change_per_sample: 20.0,
            max_sample_error: 0.15,
            sample_interval_low_ms: 10,
            sample_interval_high_ms: 200,
            gain_exponent: 2.0,
        }
    }
}

impl HillClimbingConfig {
    /// Total number of samples the controller keeps in its circular buffers.
    pub fn samples_to_measure(&self) -> usize {
        (self.wave_period * self.wave_history_size) as usize
    }
}

/// Pool-wide configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Lower bound on `max_working`. `None` derives
    /// `available_parallelism × threads_per_cpu`.
    pub min_threads: Option<u16>,
    /// Upper bound on `max_working`. `None` derives `min × 100`, capped to
    /// the packed-field range.
    pub max_threads: Option<u16>,
    /// Threads-per-core multiplier used when `min_threads` is `None`.
    /// Clamped to `[1, 50]`.
    pub threads_per_cpu: u32,
    /// Cap on successful thread creations per wall-clock second.
    pub max_creations_per_second: u32,
    /// Bounds for the randomized park timeout. Randomization avoids
    /// correlated mass self-termination of idle workers.
    pub park_timeout_min_ms: u64,
    pub park_timeout_max_ms: u64,
    /// Nominal sleep interval of the starvation monitor.
    pub monitor_interval_ms: u64,
    /// Early wake-ups tolerated per monitor cycle before the cycle is
    /// treated as a real tick anyway.
    pub monitor_max_early_wakes: u32,
    /// Minimum lifetime of a monitor thread, guarding against rapid
    /// stop/start cycling when pending work flickers around zero.
    pub monitor_min_lifetime_ms: u64,
    /// Unpark-then-create rounds attempted per starvation escalation.
    pub starvation_wake_attempts: u32,
    /// Below this CPU percentage the starvation threshold is a single
    /// monitor interval; at or above it the threshold scales with
    /// `max_working`.
    pub cpu_usage_low: i32,
    /// Above this CPU percentage the controller refuses to add threads.
    pub cpu_usage_high: i32,
    pub hill_climbing: HillClimbingConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_threads: None,
            max_threads: None,
            threads_per_cpu: 1,
            max_creations_per_second: 10,
            park_timeout_min_ms: 5_000,
            park_timeout_max_ms: 60_000,
            monitor_interval_ms: 500,
            monitor_max_early_wakes: 10,
            monitor_min_lifetime_ms: 60_000,
            starvation_wake_attempts: 5,
            cpu_usage_low: 80,
            cpu_usage_high: 95,
            hill_climbing: HillClimbingConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Default configuration with the threads-per-core multiplier read from
    /// [`THREADS_PER_CPU_ENV`].
    pub fn from_env() -> Self {
        let mut config = PoolConfig::default();
        if let Some(value) = std::env::var(THREADS_PER_CPU_ENV)
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            config.threads_per_cpu = value.clamp(1, 50);
        }
        config
    }

    /// Number of logical CPUs, with a conservative fallback.
    pub fn available_parallelism() -> u16 {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_POSSIBLE_THREADS as usize) as u16
    }

    /// Resolves the configured/derived `(limit_min, limit_max)` pair,
    /// upholding `0 < min ≤ max`.
    pub fn resolve_limits(&self) -> (u16, u16) {
        let cpus = Self::available_parallelism();
        let threads_per_cpu = self.threads_per_cpu.clamp(1, 50);

        let min = match self.min_threads {
            Some(v) => v.max(1),
            None => (cpus as u32 * threads_per_cpu).min(MAX_POSSIBLE_THREADS as u32) as u16,
        }
        .min(MAX_POSSIBLE_THREADS);

        let max = match self.max_threads {
            Some(v) => v,
            None => (min as u32).saturating_mul(100).min(MAX_POSSIBLE_THREADS as u32) as u16,
        }
        .min(MAX_POSSIBLE_THREADS)
        .max(min);

        (min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_ordered() {
        let (min, max) = PoolConfig::default().resolve_limits();
        assert!(min >= 1);
        assert!(max >= min);
    }

    #[test]
    fn test_explicit_limits_pass_through() {
        let config = PoolConfig {
            min_threads: Some(4),
            max_threads: Some(64),
            ..PoolConfig::default()
        };
        assert_eq!(config.resolve_limits(), (4, 64));
    }

    #[test]
    fn test_max_never_below_min() {
        let config = PoolConfig {
            min_threads: Some(16),
            max_threads: Some(2),
            ..PoolConfig::default()
        };
        let (min, max) = config.resolve_limits();
        assert_eq!(min, 16);
        assert_eq!(max, 16);
    }

    #[test]
    fn test_derived_max_is_capped() {
        let config = PoolConfig {
            min_threads: Some(1000),
            max_threads: None,
            ..PoolConfig::default()
        };
        let (_, max) = config.resolve_limits();
        assert_eq!(max, MAX_POSSIBLE_THREADS);
    }

    #[test]
    fn test_samples_to_measure() {
        assert_eq!(HillClimbingConfig::default().samples_to_measure(), 32);
    }
}
