#[macro_use]
extern crate criterion;

use std::time::Duration;

use criterion::{black_box, Criterion};

use tfc_config::ArbiterConfig;
use tfc_core::blocker::{CancelPoint, TimeoutThreadBlocker};
use tfc_core::time::ClockId;
use tfc_core::Arbiter;

/// Single-threaded timed waits: every block is a full stop resolved by a clock advance.
fn bench_clock_advance(c: &mut Criterion) {
    let arbiter = Arbiter::with_config(&ArbiterConfig::for_tests());

    c.bench_function("timed_wait_resolution", |b| {
        b.iter(|| {
            let deadline = arbiter.deadline_after(Duration::from_micros(10)).unwrap();
            let blocker = TimeoutThreadBlocker::new(deadline);
            let mut guard = arbiter.lock();
            black_box(
                blocker
                    .block(&mut guard, None, CancelPoint::NotCancellable)
                    .unwrap(),
            );
        })
    });
}

fn bench_clock_read(c: &mut Criterion) {
    let arbiter = Arbiter::with_config(&ArbiterConfig::for_tests());
    c.bench_function("monotonic_now", |b| {
        b.iter(|| black_box(arbiter.now(ClockId::Monotonic)))
    });
}

criterion_group!(benches, bench_clock_advance, bench_clock_read);
criterion_main!(benches);
