//! Hill-climbing concurrency controller.
//!
//! The controller owns a real-valued control setting (the desired concurrency
//! before quantization) and deliberately superimposes a small square wave on
//! it. By extracting the amplitude of the throughput signal at the wave's
//! frequency, with a Goertzel two-pole recurrence over the recent sample
//! history, it measures how strongly throughput responds to thread-count
//! changes, and moves the control setting up or down the measured gradient.
//!
//! Throughput noise is estimated from the two adjacent frequency bands and
//! folded into a confidence factor, so noisy measurements produce small,
//! cautious moves. All state here is mutated only while the pool holds its
//! heuristic lock.

use std::f64::consts::PI;
use std::time::Duration;

use rand::Rng;

use crate::complex::Complex;
use crate::config::HillClimbingConfig;

/// Interval requested when a sample had too few completions to be trusted.
const RESAMPLE_INTERVAL_MS: u32 = 10;

/// Label attached to each thread-count change, for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Not enough history yet to measure anything.
    Warmup,
    /// The thread count was changed out-of-band and the wave history was
    /// re-anchored to it.
    Initializing,
    /// Normal move along the measured throughput gradient.
    ClimbingMove,
    /// The thread-count wave was not measurable this sample.
    Stabilizing,
    /// Forced increase by the starvation monitor.
    Starvation,
}

/// The adaptive controller state. See the module docs for the algorithm.
pub struct HillClimbing {
    config: HillClimbingConfig,

    control_setting: f64,
    last_thread_count: u16,
    elapsed_since_last_change: f64,
    completions_since_last_change: u64,
    average_throughput_noise: f64,
    throughput_samples: Vec<f64>,
    thread_count_samples: Vec<f64>,
    total_samples: u64,
    current_sample_interval_ms: u32,
    accumulated_completions: u32,
    accumulated_sample_duration: f64,
}

impl HillClimbing {
    pub fn new(config: HillClimbingConfig, initial_thread_count: u16) -> Self {
        let samples = config.samples_to_measure();
        let interval =
            rand::rng().random_range(config.sample_interval_low_ms..=config.sample_interval_high_ms);
        HillClimbing {
            config,
            control_setting: initial_thread_count as f64,
            last_thread_count: initial_thread_count,
            elapsed_since_last_change: 0.0,
            completions_since_last_change: 0,
            average_throughput_noise: 0.0,
            throughput_samples: vec![0.0; samples],
            thread_count_samples: vec![0.0; samples],
            total_samples: 0,
            current_sample_interval_ms: interval,
            accumulated_completions: 0,
            accumulated_sample_duration: 0.0,
        }
    }

    pub fn control_setting(&self) -> f64 {
        self.control_setting
    }

    pub fn last_thread_count(&self) -> u16 {
        self.last_thread_count
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Consumes one `(duration, completions)` sample and re-derives the
    /// target concurrency.
    ///
    /// Returns the new thread count and the interval, in milliseconds, to
    /// wait before the next adjustment. `cpu_saturated` suppresses upward
    /// moves; adding threads to an already saturated machine only adds
    /// contention.
    pub fn update(
        &mut self,
        current_thread_count: u16,
        sample_duration: Duration,
        completions: u32,
        cpu_saturated: bool,
        limits: (u16, u16),
    ) -> (u16, u32) {
        let (limit_min, limit_max) = limits;

        // Someone (a limit setter, the starvation monitor racing us) changed
        // the thread count out of band; re-anchor the wave bookkeeping
        // without touching the sample buffers.
        if current_thread_count != self.last_thread_count {
            self.force_change(current_thread_count, Transition::Initializing);
        }

        self.elapsed_since_last_change += sample_duration.as_secs_f64();
        self.completions_since_last_change += completions as u64;

        // Fold in anything carried over from an under-confident sample.
        let sample_duration = sample_duration.as_secs_f64() + self.accumulated_sample_duration;
        let completions = completions + self.accumulated_completions;

        // Completion counting is off by up to (threadCount - 1) items per
        // interval, because threads may straddle the interval boundary
        // mid-item. That error is periodic in exactly the frequency range
        // the wave analysis targets, so it cannot be filtered out later;
        // instead, refuse samples whose relative error is too large and ask
        // for a quick re-sample.
        let sample_error = if completions == 0 {
            if current_thread_count <= 1 {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            (current_thread_count as f64 - 1.0) / completions as f64
        };
        if self.total_samples > 0 && sample_error >= self.config.max_sample_error {
            self.accumulated_sample_duration = sample_duration;
            self.accumulated_completions = completions;
            return (current_thread_count, RESAMPLE_INTERVAL_MS);
        }

        self.accumulated_sample_duration = 0.0;
        self.accumulated_completions = 0;

        let throughput = completions as f64 / sample_duration;
        let retained = self.throughput_samples.len();
        let index = (self.total_samples % retained as u64) as usize;
        self.throughput_samples[index] = throughput;
        self.thread_count_samples[index] = current_thread_count as f64;
        self.total_samples += 1;

        let mut ratio = Complex::ZERO;
        let mut confidence = 0.0;
        let mut transition = Transition::Warmup;

        // Use the largest whole number of wave periods that fits in the
        // history; a fractional period would fall between frequency bands
        // and the wave would not be measurable.
        let wave_period = self.config.wave_period as usize;
        let sample_count = (self.total_samples - 1).min(retained as u64) as usize / wave_period
            * wave_period;

        if sample_count > wave_period {
            let mut throughput_sum = 0.0;
            let mut thread_sum = 0.0;
            for i in 0..sample_count {
                let at = (self.total_samples as usize - sample_count + i) % retained;
                throughput_sum += self.throughput_samples[at];
                thread_sum += self.thread_count_samples[at];
            }
            let average_throughput = throughput_sum / sample_count as f64;
            let average_thread_count = thread_sum / sample_count as f64;

            if average_throughput > 0.0 && average_thread_count > 0.0 {
                // The two adjacent frequency bands, for the noise estimate.
                let adjacent_period_1 =
                    sample_count as f64 / (sample_count as f64 / wave_period as f64 + 1.0);
                let adjacent_period_2 =
                    sample_count as f64 / (sample_count as f64 / wave_period as f64 - 1.0);

                let throughput_wave = self
                    .wave_component(&self.throughput_samples, sample_count, wave_period as f64)
                    / average_throughput;
                let mut error_estimate = (self
                    .wave_component(&self.throughput_samples, sample_count, adjacent_period_1)
                    / average_throughput)
                    .abs();
                if adjacent_period_2 <= sample_count as f64 {
                    error_estimate = error_estimate.max(
                        (self.wave_component(
                            &self.throughput_samples,
                            sample_count,
                            adjacent_period_2,
                        ) / average_throughput)
                            .abs(),
                    );
                }

                // Thread counts are exact measurements; no noise to estimate.
                let thread_wave = self
                    .wave_component(&self.thread_count_samples, sample_count, wave_period as f64)
                    / average_thread_count;

                if self.average_throughput_noise == 0.0 {
                    self.average_throughput_noise = error_estimate;
                } else {
                    let smoothing = self.config.error_smoothing_factor;
                    self.average_throughput_noise =
                        smoothing * error_estimate + (1.0 - smoothing) * self.average_throughput_noise;
                }

                if thread_wave.abs() > 0.0 {
                    // Subtract the bias-scaled thread wave so that a flat
                    // throughput response reads as a slightly negative
                    // gradient: threads have a cost.
                    ratio = (throughput_wave - thread_wave.scale(self.config.bias)) / thread_wave;
                    transition = Transition::ClimbingMove;
                } else {
                    ratio = Complex::ZERO;
                    transition = Transition::Stabilizing;
                }

                let noise_for_confidence = self.average_throughput_noise.max(error_estimate);
                confidence = if noise_for_confidence > 0.0 {
                    (thread_wave.abs() / noise_for_confidence)
                        / self.config.target_signal_to_noise_ratio
                } else {
                    1.0
                };
            }
        }

        // Only the real part moves us: in-phase throughput response means
        // our changes are helping, anti-phase means they are hurting, and a
        // quarter-phase response is indistinguishable from noise.
        let mut move_size = ratio.re.clamp(-1.0, 1.0);
        move_size *= confidence.clamp(0.0, 1.0);

        // Non-linear gain: big gradients produce fast ramps, small ones are
        // damped to avoid oscillating around the target.
        let gain = self.config.max_change_per_second * sample_duration;
        let sign = if move_size >= 0.0 { 1.0 } else { -1.0 };
        move_size = move_size.abs().powf(self.config.gain_exponent) * sign * gain;
        move_size = move_size.min(self.config.max_change_per_sample);

        if move_size > 0.0 && cpu_saturated {
            move_size = 0.0;
        }

        self.control_setting += move_size;

        // The wave magnitude tracks the measured noise floor, so the probe
        // stays just large enough to be detectable.
        let mut wave_magnitude = (0.5
            + self.control_setting
                * self.average_throughput_noise
                * self.config.target_signal_to_noise_ratio
                * self.config.wave_magnitude_multiplier
                * 2.0) as i32;
        wave_magnitude = wave_magnitude.clamp(1, self.config.max_wave_magnitude as i32);

        self.control_setting = self
            .control_setting
            .min(limit_max as f64 - wave_magnitude as f64)
            .max(limit_min as f64);

        let half_period = (wave_period / 2).max(1) as u64;
        let wave_high = (self.total_samples / half_period) % 2;
        let mut new_thread_count =
            (self.control_setting + wave_magnitude as f64 * wave_high as f64) as i32;
        new_thread_count = new_thread_count.clamp(limit_min as i32, limit_max as i32);

        if new_thread_count != current_thread_count as i32 {
            self.change_thread_count(new_thread_count as u16, transition);
        }

        // The next interval is randomized (set in change_thread_count) to
        // avoid correlating with other periodic load in the process. When
        // we are pinned at the floor and going higher hurt us, stretch the
        // interval instead of thrashing against the minimum.
        let next_interval_ms = if ratio.re < 0.0 && new_thread_count == limit_min as i32 {
            (0.5 + self.current_sample_interval_ms as f64 * (10.0 * (-ratio.re).min(1.0))) as u32
        } else {
            self.current_sample_interval_ms
        };

        (new_thread_count as u16, next_interval_ms)
    }

    /// Re-anchors the controller after an out-of-band thread-count change
    /// (limit setter, starvation escalation) without clearing the sample
    /// history.
    pub fn force_change(&mut self, new_thread_count: u16, transition: Transition) {
        if new_thread_count != self.last_thread_count {
            self.control_setting += new_thread_count as f64 - self.last_thread_count as f64;
            self.change_thread_count(new_thread_count, transition);
        }
    }

    fn change_thread_count(&mut self, new_thread_count: u16, transition: Transition) {
        let throughput = if self.elapsed_since_last_change > 0.0 {
            self.completions_since_last_change as f64 / self.elapsed_since_last_change
        } else {
            0.0
        };
        log::debug!(
            "thread count -> {new_thread_count} ({transition:?}), \
             throughput since last change {throughput:.1}/s"
        );

        self.last_thread_count = new_thread_count;
        self.current_sample_interval_ms = rand::rng().random_range(
            self.config.sample_interval_low_ms..=self.config.sample_interval_high_ms,
        );
        self.elapsed_since_last_change = 0.0;
        self.completions_since_last_change = 0;
    }

    /// Goertzel extraction of the complex amplitude of `samples` at the
    /// given period, over the most recent `sample_count` entries.
    fn wave_component(&self, samples: &[f64], sample_count: usize, period: f64) -> Complex {
        debug_assert!(period >= 2.0, "cannot measure above the Nyquist frequency");
        debug_assert!(sample_count as f64 >= period, "wave does not fit in window");

        let w = 2.0 * PI / period;
        let cosine = w.cos();
        let sine = w.sin();
        let coefficient = 2.0 * cosine;
        let retained = samples.len();

        let mut q0;
        let mut q1 = 0.0;
        let mut q2 = 0.0;
        for i in 0..sample_count {
            let sample = samples[(self.total_samples as usize - sample_count + i) % retained];
            q0 = coefficient * q1 - q2 + sample;
            q2 = q1;
            q1 = q0;
        }

        Complex::new(q1 - q2 * cosine, q2 * sine) / sample_count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HillClimbingConfig;

    fn controller(initial: u16) -> HillClimbing {
        HillClimbing::new(HillClimbingConfig::default(), initial)
    }

    /// Synthetic workload: throughput rises linearly with thread count up to
    /// a plateau, in completions per second.
    fn plateau_completions(threads: u16, plateau: u16, per_thread: f64, secs: f64) -> u32 {
        (threads.min(plateau) as f64 * per_thread * secs) as u32
    }

    #[test]
    fn test_warmup_keeps_current_count() {
        let mut hc = controller(4);
        let (count, _) = hc.update(4, Duration::from_millis(500), 2_000, false, (1, 100));
        assert_eq!(count, 4);
        assert_eq!(hc.total_samples(), 1);
    }

    #[test]
    fn test_low_confidence_sample_is_carried_forward() {
        let mut hc = controller(8);
        hc.update(8, Duration::from_millis(500), 4_000, false, (1, 100));

        // 7/3 relative error is far above the 0.15 default cap.
        let (count, interval) = hc.update(8, Duration::from_millis(500), 3, false, (1, 100));
        assert_eq!(count, 8);
        assert_eq!(interval, RESAMPLE_INTERVAL_MS);
        // The carried sample was not pushed into the history.
        assert_eq!(hc.total_samples(), 1);
    }

    #[test]
    fn test_carried_totals_fold_into_next_sample() {
        let mut hc = controller(4);
        hc.update(4, Duration::from_millis(500), 2_000, false, (1, 100));
        hc.update(4, Duration::from_millis(500), 10, false, (1, 100));
        assert_eq!(hc.total_samples(), 1);

        // Enough completions now; both halves land in one sample.
        hc.update(4, Duration::from_millis(500), 2_000, false, (1, 100));
        assert_eq!(hc.total_samples(), 2);
    }

    #[test]
    fn test_out_of_band_change_reanchors() {
        let mut hc = controller(4);
        hc.update(4, Duration::from_millis(500), 2_000, false, (1, 100));
        let before = hc.control_setting();

        hc.update(9, Duration::from_millis(500), 4_000, false, (1, 100));
        assert!(hc.last_thread_count() >= 9);
        assert!(hc.control_setting() >= before + 4.0);
    }

    #[test]
    fn test_force_change_moves_control_setting() {
        let mut hc = controller(4);
        hc.force_change(6, Transition::Starvation);
        assert_eq!(hc.last_thread_count(), 6);
        assert_eq!(hc.control_setting(), 6.0);

        // No-op when the count already matches.
        hc.force_change(6, Transition::Starvation);
        assert_eq!(hc.last_thread_count(), 6);
    }

    #[test]
    fn test_converges_to_plateau_and_stays() {
        let mut hc = controller(2);
        let limits = (1, 40);
        let plateau = 8;
        let dt = Duration::from_millis(500);

        let mut threads: u16 = 2;
        let mut history = Vec::new();
        for _ in 0..400 {
            let completions = plateau_completions(threads, plateau, 1_000.0, 0.5);
            let (next, _) = hc.update(threads, dt, completions, false, limits);
            threads = next;
            history.push(threads);
        }

        // It climbed out of the initial setting...
        assert!(
            history.iter().any(|&t| t >= plateau - 1),
            "never approached the plateau: {history:?}"
        );
        // ...and the tail stays near the plateau without unbounded
        // oscillation (the probe wave still wiggles the count).
        let tail = &history[history.len() - 80..];
        for &t in tail {
            assert!(
                (plateau - 3..=plateau + 4).contains(&t),
                "tail strayed from plateau: {t} (tail {tail:?})"
            );
        }
    }

    #[test]
    fn test_saturated_cpu_suppresses_growth() {
        let mut hc = controller(4);
        let limits = (1, 40);
        let dt = Duration::from_millis(500);

        let mut threads: u16 = 4;
        for _ in 0..200 {
            // Throughput would keep improving up to 16 threads, but the
            // machine is reported saturated the whole time.
            let completions = plateau_completions(threads, 16, 1_000.0, 0.5);
            let (next, _) = hc.update(threads, dt, completions, true, limits);
            threads = next;
            assert!(
                threads <= 4 + hc.config.max_wave_magnitude as u16,
                "grew while saturated: {threads}"
            );
        }
    }

    #[test]
    fn test_thread_count_respects_limits() {
        let mut hc = controller(4);
        let limits = (3, 6);
        let dt = Duration::from_millis(500);

        let mut threads: u16 = 4;
        for _ in 0..100 {
            let completions = plateau_completions(threads, 32, 1_000.0, 0.5);
            let (next, _) = hc.update(threads, dt, completions, false, limits);
            threads = next;
            assert!((3..=6).contains(&threads), "left limits: {threads}");
        }
    }
}
