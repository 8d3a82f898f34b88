//! Starvation monitor.
//!
//! A single background thread, started lazily on the first work request,
//! that watches for pending work going undequeued. When work sits too long
//! it forces `max_working` up by one and injects a worker, bypassing the
//! hill-climbing controller (which is then told about the change via a
//! Starvation transition). The thread retires itself once work has been
//! absent long enough.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::cpu::CpuSampler;
use crate::hill_climbing::Transition;
use crate::pool::Shared;
use crate::worker;

pub(crate) const MONITOR_THREAD_NAME: &str = "autopool-monitor";

// Tri-state monitor status. Duplicate start requests collapse via
// WAITING_FOR_REQUEST; exactly one thread wins the NOT_RUNNING -> REQUESTED
// transition.
pub(crate) const STATUS_NOT_RUNNING: u8 = 0;
pub(crate) const STATUS_WAITING_FOR_REQUEST: u8 = 1;
pub(crate) const STATUS_REQUESTED: u8 = 2;

/// Ensures a monitor thread is alive and aware of the latest work request.
pub(crate) fn ensure_running(shared: &Arc<Shared>) {
    loop {
        match shared.monitor_status.load(Ordering::Acquire) {
            STATUS_REQUESTED => return,
            STATUS_WAITING_FOR_REQUEST => {
                if shared
                    .monitor_status
                    .compare_exchange(
                        STATUS_WAITING_FOR_REQUEST,
                        STATUS_REQUESTED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return;
                }
            }
            STATUS_NOT_RUNNING => {
                if shared.is_shutting_down() {
                    return;
                }
                if shared
                    .monitor_status
                    .compare_exchange(
                        STATUS_NOT_RUNNING,
                        STATUS_REQUESTED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    let for_thread = Arc::clone(shared);
                    match thread::Builder::new()
                        .name(MONITOR_THREAD_NAME.into())
                        .spawn(move || run(for_thread))
                    {
                        Ok(handle) => {
                            *shared.monitor_handle.lock().unwrap() = Some(handle);
                        }
                        Err(err) => {
                            log::warn!("monitor thread creation failed: {err}");
                            shared
                                .monitor_status
                                .store(STATUS_NOT_RUNNING, Ordering::Release);
                        }
                    }
                    return;
                }
            }
            status => unreachable!("invalid monitor status {status}"),
        }
    }
}

fn run(shared: Arc<Shared>) {
    log::trace!("monitor started");
    let mut cpu = CpuSampler::new();
    // Set once the monitor decides it has a reason to live; cleared when it
    // retires. Guards against rapid stop/start cycling.
    let mut keep_alive_since: Option<Instant> = None;

    loop {
        sleep_one_interval(&shared);

        if shared.is_shutting_down()
            || shared.suspended.load(Ordering::Acquire)
            || shared.pending.load(Ordering::Acquire) == 0
        {
            // Nothing to escalate; fall through to the keep-running check.
        } else {
            let usage = cpu.sample();
            shared.cpu_usage.store(usage, Ordering::Relaxed);

            if sufficient_delay_since_last_dequeue(&shared, usage) {
                escalate(&shared);
            }
        }

        if !should_keep_running(&shared, &mut keep_alive_since) {
            break;
        }
    }
    log::trace!("monitor exited");
}

/// Sleeps for one monitor interval, tolerating a bounded number of early
/// wake-ups before treating the cycle as a real tick anyway.
fn sleep_one_interval(shared: &Arc<Shared>) {
    let deadline = Instant::now() + Duration::from_millis(shared.config.monitor_interval_ms);
    let mut early_wakes = 0;

    let mut guard = shared.monitor_mutex.lock().unwrap();
    loop {
        if shared.is_shutting_down() {
            return;
        }
        let now = Instant::now();
        if now >= deadline || early_wakes >= shared.config.monitor_max_early_wakes {
            return;
        }
        let (g, result) = shared
            .monitor_cond
            .wait_timeout(guard, deadline - now)
            .unwrap();
        guard = g;
        if result.timed_out() {
            return;
        }
        early_wakes += 1;
    }
}

/// Whether work has gone undequeued long enough to count as starvation.
///
/// Under high CPU usage the threshold scales with `max_working`: a busy
/// machine legitimately takes longer to get around to queued work, and
/// escalating would only add contention.
fn sufficient_delay_since_last_dequeue(shared: &Arc<Shared>, cpu_usage: i32) -> bool {
    let threshold_ms = if cpu_usage < shared.config.cpu_usage_low {
        shared.config.monitor_interval_ms
    } else {
        let counts = shared.counters.read();
        counts.max_working as u64 * shared.config.monitor_interval_ms * 2
    };
    shared.now_ms() >= shared.last_dequeue_ms.load(Ordering::Acquire) + threshold_ms
}

/// Forces `max_working` up by one (unless already at the limit) and tries a
/// few rounds of unpark-then-create until one succeeds.
///
/// The heuristic lock is taken before the counter is touched. The adjustment
/// path reads its counter snapshot and writes the new target under that same
/// lock, so an escalation can never land inside its read/write window and be
/// overwritten by a stale snapshot.
pub(crate) fn escalate(shared: &Arc<Shared>) {
    let counts = {
        let mut heuristic = shared.heuristic.lock().unwrap();
        let limit_max = shared.limit_max.load(Ordering::Acquire);
        let raised = shared.counters.try_transact(|c| {
            if c.max_working >= limit_max {
                return false;
            }
            c.max_working += 1;
            true
        });

        let counts = match raised {
            Ok(counts) => counts,
            Err(_) => return, // already at limit_max
        };

        heuristic
            .hill
            .force_change(counts.max_working, Transition::Starvation);
        counts
    };

    log::debug!(
        "starvation detected, max_working raised to {}",
        counts.max_working
    );
    #[cfg(feature = "metrics")]
    shared.metrics.bump(|m| &m.starvation_escalations);

    for _ in 0..shared.config.starvation_wake_attempts {
        if shared.is_shutting_down() {
            break;
        }
        if shared.gate.unpark_one() {
            break;
        }
        if worker::try_create(shared) {
            break;
        }
    }
}

/// End-of-cycle liveness decision, mirrored by `ensure_running` on the
/// request side: a request arriving between our status exchange and the
/// final CAS flips the status back to Requested and keeps us alive.
fn should_keep_running(shared: &Arc<Shared>, keep_alive_since: &mut Option<Instant>) -> bool {
    let previous = shared
        .monitor_status
        .swap(STATUS_WAITING_FOR_REQUEST, Ordering::AcqRel);
    debug_assert!(previous == STATUS_WAITING_FOR_REQUEST || previous == STATUS_REQUESTED);

    if previous != STATUS_WAITING_FOR_REQUEST {
        // A fresh request arrived this cycle; definitely keep running.
        return true;
    }

    let mut keep_running = true;
    let mut forced = false;

    if shared.is_shutting_down() {
        keep_running = false;
    } else {
        if shared.pending.load(Ordering::Acquire) == 0 {
            keep_running = false;
        }
        if !keep_running {
            // Minimum-lifetime guard: do not retire a freshly started
            // monitor the moment the queue flickers to empty.
            let lifetime_ok = keep_alive_since
                .map(|since| {
                    since.elapsed() >= Duration::from_millis(shared.config.monitor_min_lifetime_ms)
                })
                .unwrap_or(false);
            if !lifetime_ok {
                keep_running = true;
                forced = true;
            }
        }
    }

    if keep_running {
        if keep_alive_since.is_none() {
            *keep_alive_since = Some(Instant::now());
        } else if !forced {
            *keep_alive_since = Some(Instant::now());
        }
        return true;
    }

    *keep_alive_since = None;
    if shared
        .monitor_status
        .compare_exchange(
            STATUS_WAITING_FOR_REQUEST,
            STATUS_NOT_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
    {
        return false;
    }
    // Lost the race with a new request; keep running.
    true
}
