//! Worker thread lifecycle.
//!
//! A worker moves through *Starting → Working → Parked → Working → … →
//! Exited*. It claims pending work with a non-blocking decrement, runs the
//! pool's execution callback once per claimed item, and parks when nothing is
//! available. A park that times out ends the thread: headcount shrinks with
//! no bookkeeping beyond the packed counter.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::park::ParkOutcome;
use crate::pool::{self, Shared};

pub(crate) const WORKER_THREAD_NAME: &str = "autopool-worker";

/// Attempts to create one worker thread, honoring the per-second creation
/// cap and the `working < max_working` growth gate.
///
/// The creation lock is held across the whole attempt so the rate window,
/// the `starting` slot and the spawn stay consistent; nothing inside blocks
/// on caller-supplied code.
pub(crate) fn try_create(shared: &Arc<Shared>) -> bool {
    if shared.is_shutting_down() {
        return false;
    }

    let mut limiter = shared.creation.lock().unwrap();
    let now_second = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    if !limiter.admit(now_second) {
        #[cfg(feature = "metrics")]
        shared.metrics.bump(|m| &m.creations_throttled);
        return false;
    }

    // Claim a starting slot only if there is room to grow.
    if shared
        .counters
        .try_transact(|c| {
            if c.working >= c.max_working {
                return false;
            }
            c.starting += 1;
            true
        })
        .is_err()
    {
        return false;
    }

    match spawn(shared) {
        Ok(handle) => {
            limiter.commit();
            shared.register_worker(handle);
            #[cfg(feature = "metrics")]
            shared.metrics.bump(|m| &m.threads_created);
            true
        }
        Err(err) => {
            log::warn!("worker thread creation failed: {err}");
            shared.counters.transact(|c| c.starting -= 1);
            false
        }
    }
}

fn spawn(shared: &Arc<Shared>) -> std::io::Result<thread::JoinHandle<()>> {
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name(WORKER_THREAD_NAME.into())
        .spawn(move || run(shared))
}

fn run(shared: Arc<Shared>) {
    shared.counters.transact(|c| {
        c.starting -= 1;
        c.working += 1;
    });
    log::trace!("worker started");

    while !shared.is_shutting_down() {
        if shared.try_claim_work() {
            (shared.execute)();
            if pool::notify_completed(&shared) {
                continue;
            }
            // Over the working limit (it was lowered while we ran); park
            // instead of claiming more.
        }

        shared.counters.transact(|c| {
            c.working -= 1;
            c.parked += 1;
        });
        #[cfg(feature = "metrics")]
        shared.metrics.bump(|m| &m.parks);

        let timeout = Duration::from_millis(rand::rng().random_range(
            shared.config.park_timeout_min_ms..=shared.config.park_timeout_max_ms,
        ));
        let outcome = shared.gate.park(timeout, shared.shutdown_flag());

        shared.counters.transact(|c| {
            c.parked -= 1;
            c.working += 1;
        });

        if outcome == ParkOutcome::TimedOut {
            #[cfg(feature = "metrics")]
            shared.metrics.bump(|m| &m.park_timeouts);
            log::trace!("idle worker timed out, exiting");
            break;
        }
    }

    shared.counters.transact(|c| c.working -= 1);
    log::trace!("worker exited");
}
