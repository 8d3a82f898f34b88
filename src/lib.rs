//! # autopool: self-sizing worker thread pool
//!
//! A pool of native worker threads that keeps itself sized to the offered
//! load: callers never specify a thread count. The pool continuously decides
//! how many threads should be executing, parks idle threads instead of
//! spinning, rate-limits thread creation, and escalates when queued work is
//! starved of execution time.
//!
//! ## Architecture
//!
//! - **Packed counter**: the four thread-state fields updated together via
//!   compare-and-swap, so composite transitions are never torn
//! - **Park gate**: a mutex/condvar pair where idle workers block with a
//!   randomized timeout; timing out retires the thread
//! - **Hill-climbing controller**: superimposes a small square wave on the
//!   target concurrency, measures in the frequency domain how strongly
//!   throughput responds, and climbs the measured gradient
//! - **Starvation monitor**: a lazily started background thread that forces
//!   concurrency up when pending work is not being dequeued
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use autopool::ThreadPool;
//!
//! let executed = Arc::new(AtomicUsize::new(0));
//! let executed_in_pool = Arc::clone(&executed);
//!
//! // The callback is invoked once per claimed work item; dequeueing the
//! // actual item is the caller's business.
//! let pool = ThreadPool::new(move || {
//!     executed_in_pool.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! pool.request_worker(); // one work item is available
//! # std::thread::sleep(std::time::Duration::from_millis(50));
//! pool.shutdown().unwrap();
//! ```

pub mod complex;
pub mod config;
pub mod counter;
pub mod cpu;
pub mod hill_climbing;
pub mod limiter;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod park;
pub mod pool;

mod monitor;
mod worker;

pub use config::{HillClimbingConfig, PoolConfig};
pub use counter::Counts;
pub use hill_climbing::{HillClimbing, Transition};
pub use pool::ThreadPool;
