//! Park/unpark gate for idle workers.
//!
//! Idle workers block here on a condition variable instead of spinning.
//! Wake-ups are tracked as tokens inside the mutex so that a burst of
//! `unpark_one` calls wakes at most one thread per parked thread: a spurious
//! condition-variable wake-up without a token goes back to sleep, and an
//! unpark issued before the target thread reaches the wait call is not lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Why a parked worker woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkOutcome {
    /// Explicit unpark or pool shutdown; the worker goes back to work.
    Unparked,
    /// The randomized timeout elapsed; the worker should exit.
    TimedOut,
}

#[derive(Debug, Default)]
struct GateState {
    parked: u32,
    wake_tokens: u32,
}

/// Mutex + condvar pair with a parked-thread count.
pub struct ParkGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl ParkGate {
    pub fn new() -> Self {
        ParkGate {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
        }
    }

    /// Blocks the calling worker until it is unparked, the pool shuts down,
    /// or `timeout` elapses.
    ///
    /// The shutdown flag is re-checked inside the lock, so a shutdown
    /// broadcast issued before this thread reaches the wait call still
    /// short-circuits it.
    pub fn park(&self, timeout: Duration, shutting_down: &AtomicBool) -> ParkOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        state.parked += 1;

        let outcome = loop {
            if shutting_down.load(Ordering::Acquire) {
                break ParkOutcome::Unparked;
            }
            if state.wake_tokens > 0 {
                state.wake_tokens -= 1;
                break ParkOutcome::Unparked;
            }
            let now = Instant::now();
            if now >= deadline {
                break ParkOutcome::TimedOut;
            }
            let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        };

        state.parked -= 1;
        outcome
    }

    /// Wakes one parked worker if any is parked and not already spoken for.
    ///
    /// Best-effort: returns whether a wake token was handed out, not whether
    /// the woken thread has resumed yet.
    pub fn unpark_one(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.wake_tokens < state.parked {
            state.wake_tokens += 1;
            self.cond.notify_one();
            true
        } else {
            false
        }
    }

    /// Wakes every parked worker. Used together with the shutdown flag; the
    /// woken threads observe it and exit instead of consuming tokens.
    pub fn unpark_all(&self) {
        let _state = self.state.lock().unwrap();
        self.cond.notify_all();
    }

    pub fn parked_count(&self) -> u32 {
        self.state.lock().unwrap().parked
    }
}

impl Default for ParkGate {
    fn default() -> Self {
        ParkGate::new()
    }
}
