//! Packed worker-state counter.
//!
//! The four thread-state fields (`max_working`, `starting`, `working`,
//! `parked`) are packed into a single `AtomicU64` and always updated together
//! in a compare-and-swap retry loop. Composite transitions such as
//! "decrement `parked`, increment `working`" are therefore atomic: no reader
//! ever observes a torn intermediate state, and no lock is held across an
//! update.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::{Backoff, CachePadded};

/// One unpacked snapshot of the worker-state counter.
///
/// Field overflow or underflow indicates a logic bug, not a runtime
/// condition; in debug builds the normal integer overflow checks (and the
/// `debug_assert!` in `pack`) turn it into a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counts {
    /// Upper bound on concurrently working threads, as decided by the
    /// hill-climbing controller (and bumped by the starvation monitor).
    pub max_working: u16,
    /// Threads whose creation has been committed but that have not yet
    /// entered their run loop.
    pub starting: u16,
    /// Threads currently claiming or executing work.
    pub working: u16,
    /// Threads blocked on the park gate.
    pub parked: u16,
}

impl Counts {
    fn unpack(raw: u64) -> Self {
        Counts {
            max_working: (raw >> 48) as u16,
            starting: (raw >> 32) as u16,
            working: (raw >> 16) as u16,
            parked: raw as u16,
        }
    }

    fn pack(self) -> u64 {
        debug_assert!(self.max_working > 0, "max_working must stay positive");
        ((self.max_working as u64) << 48)
            | ((self.starting as u64) << 32)
            | ((self.working as u64) << 16)
            | (self.parked as u64)
    }
}

/// Atomically updated packed counter.
pub struct PackedCounter {
    raw: CachePadded<AtomicU64>,
}

impl PackedCounter {
    pub fn new(initial: Counts) -> Self {
        PackedCounter {
            raw: CachePadded::new(AtomicU64::new(initial.pack())),
        }
    }

    /// Returns the current snapshot.
    pub fn read(&self) -> Counts {
        Counts::unpack(self.raw.load(Ordering::Acquire))
    }

    /// Applies `f` to the current counts in a CAS retry loop.
    ///
    /// `f` may run multiple times and must be a pure function of its
    /// argument. Returns the counts as they were after the successful
    /// update.
    pub fn transact(&self, mut f: impl FnMut(&mut Counts)) -> Counts {
        let backoff = Backoff::new();
        let mut current = self.raw.load(Ordering::Acquire);
        loop {
            let mut counts = Counts::unpack(current);
            f(&mut counts);
            match self.raw.compare_exchange_weak(
                current,
                counts.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return counts,
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Like [`transact`](Self::transact), but `f` may abort by returning
    /// `false`, in which case nothing is written.
    ///
    /// Returns `Ok(new_counts)` when the update was applied and
    /// `Err(observed_counts)` when `f` aborted.
    pub fn try_transact(&self, mut f: impl FnMut(&mut Counts) -> bool) -> Result<Counts, Counts> {
        let backoff = Backoff::new();
        let mut current = self.raw.load(Ordering::Acquire);
        loop {
            let mut counts = Counts::unpack(current);
            if !f(&mut counts) {
                return Err(Counts::unpack(current));
            }
            match self.raw.compare_exchange_weak(
                current,
                counts.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(counts),
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pack_unpack_roundtrip() {
        let counts = Counts {
            max_working: 17,
            starting: 3,
            working: 12,
            parked: 5,
        };
        assert_eq!(Counts::unpack(counts.pack()), counts);
    }

    #[test]
    fn test_transact_composite_update() {
        let counter = PackedCounter::new(Counts {
            max_working: 4,
            starting: 0,
            working: 2,
            parked: 1,
        });

        let after = counter.transact(|c| {
            c.parked -= 1;
            c.working += 1;
        });
        assert_eq!(after.parked, 0);
        assert_eq!(after.working, 3);
        assert_eq!(counter.read(), after);
    }

    #[test]
    fn test_try_transact_abort_leaves_state_untouched() {
        let initial = Counts {
            max_working: 2,
            starting: 0,
            working: 2,
            parked: 0,
        };
        let counter = PackedCounter::new(initial);

        let result = counter.try_transact(|c| {
            if c.working >= c.max_working {
                return false;
            }
            c.starting += 1;
            true
        });

        assert_eq!(result, Err(initial));
        assert_eq!(counter.read(), initial);
    }

    #[test]
    fn test_concurrent_transacts_do_not_tear() {
        let counter = Arc::new(PackedCounter::new(Counts {
            max_working: 1,
            ..Counts::default()
        }));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    counter.transact(|c| {
                        c.starting += 1;
                        c.working += 1;
                    });
                    counter.transact(|c| {
                        c.starting -= 1;
                        c.working -= 1;
                    });
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let counts = counter.read();
        assert_eq!(counts.starting, 0);
        assert_eq!(counts.working, 0);
        assert_eq!(counts.max_working, 1);
    }
}
