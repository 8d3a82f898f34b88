//! The pool handle and the heuristic gate around the controller.
//!
//! `ThreadPool` is an explicitly owned handle; all shared state lives in one
//! reference-counted `Shared` struct that workers and the monitor hold onto.
//! There is no process-global singleton: teardown is an explicit join in
//! [`ThreadPool::shutdown`].

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::utils::CachePadded;

use crate::config::PoolConfig;
use crate::counter::{Counts, PackedCounter};
use crate::hill_climbing::{HillClimbing, Transition};
use crate::limiter::CreationLimiter;
#[cfg(feature = "metrics")]
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::monitor;
use crate::park::ParkGate;
use crate::worker;

/// Controller state guarded by the heuristic lock. Acquired non-blockingly
/// on the adjustment path; at most one update runs at a time and losers
/// simply fold their sample into the next winner's window.
pub(crate) struct Heuristic {
    pub(crate) hill: HillClimbing,
    pub(crate) sample_start: Instant,
}

/// State shared between the pool handle, its workers and the monitor.
pub(crate) struct Shared {
    pub(crate) config: PoolConfig,
    pub(crate) counters: PackedCounter,
    /// Work items enqueued but not yet claimed by a worker.
    pub(crate) pending: CachePadded<AtomicU64>,
    pub(crate) limit_min: AtomicU16,
    pub(crate) limit_max: AtomicU16,
    /// While set, no unparks or creations are issued (debugger attach etc).
    pub(crate) suspended: AtomicBool,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) gate: ParkGate,
    pub(crate) creation: Mutex<CreationLimiter>,
    /// Invoked once per claimed work item; opaque to the pool.
    pub(crate) execute: Box<dyn Fn() + Send + Sync>,

    pub(crate) heuristic: Mutex<Heuristic>,
    /// Completions since the last consumed sample.
    pub(crate) completions: AtomicU32,
    pub(crate) last_dequeue_ms: AtomicU64,
    pub(crate) last_adjustment_ms: AtomicU64,
    pub(crate) adjustment_interval_ms: AtomicU32,
    /// Time origin for the millisecond stamps above.
    pub(crate) epoch: Instant,

    pub(crate) monitor_status: AtomicU8,
    pub(crate) monitor_mutex: Mutex<()>,
    pub(crate) monitor_cond: Condvar,
    pub(crate) monitor_handle: Mutex<Option<JoinHandle<()>>>,
    /// Last CPU utilization sampled by the monitor, in percent.
    pub(crate) cpu_usage: AtomicI32,

    pub(crate) workers: Mutex<Vec<JoinHandle<()>>>,

    #[cfg(feature = "metrics")]
    pub(crate) metrics: Metrics,
}

impl Shared {
    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown_flag(&self) -> &AtomicBool {
        &self.shutting_down
    }

    /// Non-blocking claim of one pending work item; fails when none remain.
    pub(crate) fn try_claim_work(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Adds a worker join handle to the registry, reaping handles of threads
    /// that already exited (idle timeout) so the registry stays bounded.
    ///
    /// The shutdown flag is re-checked under the registry lock: shutdown
    /// drains the registry under the same lock after setting the flag, so a
    /// racing creation either lands in the drained set or is joined right
    /// here. Either way shutdown's return means every worker has exited.
    pub(crate) fn register_worker(&self, handle: JoinHandle<()>) {
        let mut workers = self.workers.lock().unwrap();
        if self.shutting_down.load(Ordering::Acquire) {
            drop(workers);
            let _ = handle.join();
            return;
        }
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
    }
}

/// Wakes or creates one worker: unpark if anyone is parked, otherwise try to
/// create (gated by `working < max_working` and the creation rate cap).
/// Suspended pools ignore the request; the next one retries.
pub(crate) fn wake_worker(shared: &Arc<Shared>) -> bool {
    if shared.suspended.load(Ordering::Acquire) {
        return false;
    }
    if shared.gate.unpark_one() {
        #[cfg(feature = "metrics")]
        shared.metrics.bump(|m| &m.unparks);
        return true;
    }
    worker::try_create(shared)
}

/// Completion-side heuristic gate: stamp the dequeue time, count and, when
/// enough time has passed since the last adjustment, run one controller
/// update under a non-blocking try-lock.
pub(crate) fn notify_completed(shared: &Arc<Shared>) -> bool {
    shared.completions.fetch_add(1, Ordering::Relaxed);
    let now = shared.now_ms();
    shared.last_dequeue_ms.store(now, Ordering::Release);

    if should_adjust(shared, now) {
        adjust(shared);
    }

    let counts = shared.counters.read();
    counts.working <= counts.max_working
}

fn should_adjust(shared: &Arc<Shared>, now_ms: u64) -> bool {
    let interval = shared.adjustment_interval_ms.load(Ordering::Relaxed) as u64;
    if now_ms <= shared.last_adjustment_ms.load(Ordering::Relaxed) + interval {
        return false;
    }
    let counts = shared.counters.read();
    counts.working <= counts.max_working
}

fn adjust(shared: &Arc<Shared>) {
    // Somebody else mid-update means our sample is simply deferred; it stays
    // in the completions accumulator for the next caller.
    let Ok(mut heuristic) = shared.heuristic.try_lock() else {
        return;
    };

    let sample_end = Instant::now();
    let sample_duration = sample_end.duration_since(heuristic.sample_start);
    let interval = shared.adjustment_interval_ms.load(Ordering::Relaxed) as u64;
    if sample_duration.as_millis() as u64 * 2 < interval {
        return;
    }

    let completions = shared.completions.swap(0, Ordering::Relaxed);
    let counts = shared.counters.read();
    let cpu_saturated = shared.cpu_usage.load(Ordering::Relaxed) > shared.config.cpu_usage_high;
    let limits = (
        shared.limit_min.load(Ordering::Acquire),
        shared.limit_max.load(Ordering::Acquire),
    );

    let (new_max, next_interval_ms) = heuristic.hill.update(
        counts.max_working,
        sample_duration,
        completions,
        cpu_saturated,
        limits,
    );

    if new_max != counts.max_working {
        shared.counters.transact(|c| c.max_working = new_max);
        if new_max > counts.max_working {
            // Growing: inject a worker. If it finds work it will keep
            // working and the next adjustment can grow further.
            wake_worker(shared);
        }
        // Shrinking needs no action: workers over the limit notice via
        // notify_completed and park themselves.
    }

    shared
        .adjustment_interval_ms
        .store(next_interval_ms.max(1), Ordering::Relaxed);
    heuristic.sample_start = sample_end;
    shared
        .last_adjustment_ms
        .store(shared.now_ms(), Ordering::Relaxed);
    #[cfg(feature = "metrics")]
    shared.metrics.bump(|m| &m.adjustments);
}

/// A self-sizing pool of worker threads.
///
/// The pool decides on its own how many threads should be running: callers
/// only signal work availability with [`request_worker`](Self::request_worker)
/// and report completions with [`notify_completed`](Self::notify_completed)
/// (which the built-in worker loop already does after each callback).
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Creates a pool with configuration derived from the environment.
    ///
    /// `execute_one` is invoked exactly once per claimed work item and must
    /// handle its own errors; a panic inside it ends that worker thread and
    /// is reported by [`shutdown`](Self::shutdown).
    pub fn new(execute_one: impl Fn() + Send + Sync + 'static) -> Self {
        Self::with_config(PoolConfig::from_env(), execute_one)
    }

    /// Creates a pool with an explicit configuration.
    pub fn with_config(config: PoolConfig, execute_one: impl Fn() + Send + Sync + 'static) -> Self {
        let (limit_min, limit_max) = config.resolve_limits();
        let hill = HillClimbing::new(config.hill_climbing.clone(), limit_min);
        let initial_interval = config.hill_climbing.sample_interval_low_ms;

        let shared = Arc::new(Shared {
            counters: PackedCounter::new(Counts {
                max_working: limit_min,
                starting: 0,
                working: 0,
                parked: 0,
            }),
            pending: CachePadded::new(AtomicU64::new(0)),
            limit_min: AtomicU16::new(limit_min),
            limit_max: AtomicU16::new(limit_max),
            suspended: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            gate: ParkGate::new(),
            creation: Mutex::new(CreationLimiter::new(config.max_creations_per_second)),
            execute: Box::new(execute_one),
            heuristic: Mutex::new(Heuristic {
                hill,
                sample_start: Instant::now(),
            }),
            completions: AtomicU32::new(0),
            last_dequeue_ms: AtomicU64::new(0),
            last_adjustment_ms: AtomicU64::new(0),
            adjustment_interval_ms: AtomicU32::new(initial_interval),
            epoch: Instant::now(),
            monitor_status: AtomicU8::new(monitor::STATUS_NOT_RUNNING),
            monitor_mutex: Mutex::new(()),
            monitor_cond: Condvar::new(),
            monitor_handle: Mutex::new(None),
            cpu_usage: AtomicI32::new(0),
            workers: Mutex::new(Vec::new()),
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
            config,
        });

        ThreadPool { shared }
    }

    /// Signals that at least one work item is available. Extra calls are
    /// harmless; a dropped wake is retried by the next call.
    pub fn request_worker(&self) {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        monitor::ensure_running(&self.shared);
        wake_worker(&self.shared);
    }

    /// Reports one completed work item. Returns whether the caller should
    /// keep working immediately (`working ≤ max_working`) or consider
    /// parking. The built-in worker loop calls this after every callback;
    /// external dispatch layers may call it too.
    pub fn notify_completed(&self) -> bool {
        notify_completed(&self.shared)
    }

    pub fn min_threads(&self) -> u16 {
        self.shared.limit_min.load(Ordering::Acquire)
    }

    pub fn max_threads(&self) -> u16 {
        self.shared.limit_max.load(Ordering::Acquire)
    }

    /// Sets the lower bound on concurrency. Fails (with no state change) if
    /// `value` is zero or above the current maximum.
    pub fn set_min_threads(&self, value: u16) -> bool {
        if value == 0 || value > self.shared.limit_max.load(Ordering::Acquire) {
            return false;
        }
        self.shared.limit_min.store(value, Ordering::Release);
        self.clamp_max_working();
        true
    }

    /// Sets the upper bound on concurrency. Fails (with no state change) if
    /// `value` is below the current minimum or below the machine's available
    /// parallelism.
    pub fn set_max_threads(&self, value: u16) -> bool {
        if value < self.shared.limit_min.load(Ordering::Acquire)
            || value < PoolConfig::available_parallelism()
        {
            return false;
        }
        self.shared.limit_max.store(value, Ordering::Release);
        self.clamp_max_working();
        true
    }

    /// Freezes (or resumes) growth: while suspended no unparks or creations
    /// are issued. Resuming immediately retries a wake so work queued during
    /// the suspension is picked up.
    pub fn set_suspended(&self, suspended: bool) {
        let was = self.shared.suspended.swap(suspended, Ordering::AcqRel);
        if was && !suspended {
            wake_worker(&self.shared);
        }
    }

    pub fn suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }

    /// Diagnostic snapshot of the packed counter.
    pub fn counts(&self) -> Counts {
        self.shared.counters.read()
    }

    /// Work items requested but not yet claimed.
    pub fn pending_work(&self) -> u64 {
        self.shared.pending.load(Ordering::Acquire)
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Releases parked and idle threads and joins every pool thread.
    ///
    /// In-flight execution callbacks are not interrupted; shutdown returns
    /// once they finish and their threads exit. Returns `Err` with a message
    /// naming how many worker threads panicked, if any did.
    pub fn shutdown(self) -> Result<(), String> {
        self.shared.shutting_down.store(true, Ordering::Release);

        // Parked workers wake via the broadcast; threads that have not yet
        // reached the wait call observe the flag inside the gate's lock.
        self.shared.gate.unpark_all();
        {
            let _guard = self.shared.monitor_mutex.lock().unwrap();
            self.shared.monitor_cond.notify_all();
        }

        let workers = std::mem::take(&mut *self.shared.workers.lock().unwrap());
        let mut panicked = 0usize;
        for handle in workers {
            if handle.join().is_err() {
                panicked += 1;
            }
        }

        if let Some(handle) = self.shared.monitor_handle.lock().unwrap().take() {
            if handle.join().is_err() {
                panicked += 1;
            }
        }

        if panicked > 0 {
            Err(format!("{panicked} pool thread(s) panicked"))
        } else {
            Ok(())
        }
    }

    /// Clamps `counters.max_working` back inside the configured limits after
    /// a bound change, telling the controller about the forced move.
    ///
    /// Like the starvation escalation, the clamp holds the heuristic lock
    /// across the counter write so a concurrent adjustment cannot overwrite
    /// it from a stale snapshot.
    fn clamp_max_working(&self) {
        let min = self.shared.limit_min.load(Ordering::Acquire);
        let max = self.shared.limit_max.load(Ordering::Acquire);
        let mut heuristic = self.shared.heuristic.lock().unwrap();
        let clamped = self.shared.counters.try_transact(|c| {
            let bounded = c.max_working.clamp(min, max);
            if bounded == c.max_working {
                return false;
            }
            c.max_working = bounded;
            true
        });
        if let Ok(counts) = clamped {
            heuristic
                .hill
                .force_change(counts.max_working, Transition::Initializing);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn quick_config() -> PoolConfig {
        PoolConfig {
            min_threads: Some(4),
            max_threads: Some(64),
            park_timeout_min_ms: 50,
            park_timeout_max_ms: 100,
            monitor_interval_ms: 25,
            monitor_min_lifetime_ms: 100,
            ..PoolConfig::default()
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_initial_counts_match_limits() {
        let pool = ThreadPool::with_config(quick_config(), || {});
        let counts = pool.counts();
        assert_eq!(counts.max_working, 4);
        assert_eq!(counts.working, 0);
        assert_eq!(counts.parked, 0);
        assert_eq!(pool.pending_work(), 0);
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_single_request_runs_one_worker() {
        let executed = Arc::new(AtomicUsize::new(0));
        let executed_clone = Arc::clone(&executed);
        let pool = ThreadPool::with_config(quick_config(), move || {
            executed_clone.fetch_add(1, Ordering::SeqCst);
        });

        pool.request_worker();
        assert!(wait_until(Duration::from_secs(2), || {
            executed.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(pool.pending_work(), 0);

        // The single worker eventually parks or retires; no extra threads
        // appear for a single item.
        assert!(wait_until(Duration::from_secs(2), || {
            let counts = pool.counts();
            counts.working + counts.parked + counts.starting <= 1
        }));
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_limit_setters_validate() {
        let pool = ThreadPool::with_config(quick_config(), || {});

        assert!(!pool.set_min_threads(0));
        assert!(!pool.set_min_threads(65));
        assert!(pool.set_min_threads(8));
        assert_eq!(pool.min_threads(), 8);

        assert!(!pool.set_max_threads(7));
        assert!(pool.set_max_threads(1024));
        assert_eq!(pool.max_threads(), 1024);

        // max_working got pulled up to the new minimum.
        assert!(pool.counts().max_working >= 8);
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_suspended_pool_defers_work() {
        let executed = Arc::new(AtomicUsize::new(0));
        let executed_clone = Arc::clone(&executed);
        let pool = ThreadPool::with_config(quick_config(), move || {
            executed_clone.fetch_add(1, Ordering::SeqCst);
        });

        pool.set_suspended(true);
        for _ in 0..3 {
            pool.request_worker();
        }
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert_eq!(pool.counts().working, 0);

        pool.set_suspended(false);
        assert!(wait_until(Duration::from_secs(2), || {
            executed.load(Ordering::SeqCst) == 3
        }));
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_starvation_raise_survives_concurrent_adjustment() {
        let pool = ThreadPool::with_config(quick_config(), || {});
        let shared = Arc::clone(&pool.shared);

        // Hold the controller lock the way the adjustment path does between
        // its counter snapshot and its counter write. The escalation must
        // wait for the lock instead of slipping its raise into that window.
        let guard = shared.heuristic.lock().unwrap();
        let escalator = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || monitor::escalate(&shared))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.counts().max_working, 4, "escalation did not wait");
        drop(guard);
        escalator.join().unwrap();

        // The raise landed and the controller was told about it.
        assert_eq!(pool.counts().max_working, 5);
        assert_eq!(
            shared.heuristic.lock().unwrap().hill.last_thread_count(),
            5
        );
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_registration_after_shutdown_does_not_leak_handles() {
        let pool = ThreadPool::with_config(quick_config(), || {});
        pool.shared.shutting_down.store(true, Ordering::Release);

        let handle = std::thread::spawn(|| {});
        pool.shared.register_worker(handle);
        assert!(
            pool.shared.workers.lock().unwrap().is_empty(),
            "handle registered past shutdown"
        );

        pool.shared.shutting_down.store(false, Ordering::Release);
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_with_parked_workers() {
        let config = PoolConfig {
            // Long park window so workers are still parked at shutdown.
            park_timeout_min_ms: 30_000,
            park_timeout_max_ms: 60_000,
            ..quick_config()
        };
        let pool = ThreadPool::with_config(config, || {});

        for _ in 0..2 {
            pool.request_worker();
        }
        wait_until(Duration::from_secs(2), || pool.counts().parked == 2);
        pool.shutdown().unwrap();
    }
}
