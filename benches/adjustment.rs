//! Controller adjustment benchmark using criterion.
//!
//! Measures the cost of one hill-climbing update in steady state, which is
//! the work done on the completion path every adjustment interval.

use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};

use autopool::{HillClimbing, HillClimbingConfig};

fn bench_hill_climbing_update(c: &mut Criterion) {
    c.bench_function("hill_climbing_update", |b| {
        let mut controller = HillClimbing::new(HillClimbingConfig::default(), 8);
        let mut threads: u16 = 8;

        // Warm the sample history so the bench measures the full
        // frequency-domain path, not the warmup shortcut.
        for _ in 0..64 {
            let (next, _) = controller.update(
                threads,
                Duration::from_millis(100),
                1_000,
                false,
                (1, 64),
            );
            threads = next;
        }

        b.iter(|| {
            let (next, interval) = controller.update(
                black_box(threads),
                Duration::from_millis(100),
                black_box(1_000),
                false,
                (1, 64),
            );
            threads = next;
            black_box(interval)
        });
    });
}

criterion_group!(benches, bench_hill_climbing_update);
criterion_main!(benches);
