//! Per-second cap on worker thread creation.
//!
//! When load spikes, many concurrent `request_worker` calls can all decide to
//! create a thread; this window bounds how many creations actually happen in
//! any single wall-clock second so a burst cannot turn into a creation storm.

/// Creation-rate window. Callers supply the current wall-clock second so the
/// window logic stays deterministic under test.
///
/// Not internally synchronized; the pool keeps it behind its creation lock.
#[derive(Debug)]
pub struct CreationLimiter {
    cap: u32,
    current_second: u64,
    created_this_second: u32,
}

impl CreationLimiter {
    pub fn new(cap: u32) -> Self {
        CreationLimiter {
            cap,
            current_second: 0,
            created_this_second: 0,
        }
    }

    /// Rotates the window if the second changed and reports whether another
    /// creation is admissible. Does not consume the slot; call
    /// [`commit`](Self::commit) once the thread actually started.
    pub fn admit(&mut self, now_second: u64) -> bool {
        if self.current_second != now_second {
            self.current_second = now_second;
            self.created_this_second = 0;
        }
        debug_assert!(self.created_this_second <= self.cap);
        self.created_this_second < self.cap
    }

    /// Records one successful thread creation in the current window.
    pub fn commit(&mut self) {
        self.created_this_second += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_within_one_second() {
        let mut limiter = CreationLimiter::new(3);
        for _ in 0..3 {
            assert!(limiter.admit(100));
            limiter.commit();
        }
        assert!(!limiter.admit(100));
    }

    #[test]
    fn test_window_resets_on_new_second() {
        let mut limiter = CreationLimiter::new(2);
        for _ in 0..2 {
            assert!(limiter.admit(100));
            limiter.commit();
        }
        assert!(!limiter.admit(100));
        assert!(limiter.admit(101));
        limiter.commit();
        assert!(limiter.admit(101));
    }

    #[test]
    fn test_admit_without_commit_does_not_consume() {
        let mut limiter = CreationLimiter::new(1);
        assert!(limiter.admit(7));
        assert!(limiter.admit(7));
        limiter.commit();
        assert!(!limiter.admit(7));
    }
}
