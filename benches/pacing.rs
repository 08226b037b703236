//! Offer-path throughput for the sync primitives

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use pacer::scheduler::VirtualScheduler;
use pacer::{
    Batcher, BatcherOptions, Debouncer, DebouncerOptions, Queuer, QueuerOptions, RateLimiter,
    RateLimiterOptions, Throttler, ThrottlerOptions, WindowType,
};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

fn bench_debouncer_offer(c: &mut Criterion) {
    let clock = Arc::new(VirtualScheduler::new());
    let d = Debouncer::new(
        |v: u64| {
            black_box(v);
        },
        DebouncerOptions::default()
            .with_wait(Duration::from_millis(10))
            .with_scheduler(clock),
    );
    c.bench_function("debouncer_offer", |b| {
        b.iter(|| d.maybe_execute(black_box(1)))
    });
}

fn bench_throttler_offer(c: &mut Criterion) {
    let clock = Arc::new(VirtualScheduler::new());
    let t = Throttler::new(
        |v: u64| {
            black_box(v);
        },
        ThrottlerOptions::default()
            .with_wait(Duration::from_millis(10))
            .with_scheduler(clock),
    );
    c.bench_function("throttler_offer", |b| {
        b.iter(|| t.maybe_execute(black_box(1)))
    });
}

fn bench_rate_limiter_offer(c: &mut Criterion) {
    let clock = Arc::new(VirtualScheduler::new());
    let l = RateLimiter::new(
        |v: u64| {
            black_box(v);
        },
        RateLimiterOptions::default()
            .with_limit(100)
            .with_window(Duration::from_secs(1))
            .with_window_type(WindowType::Sliding)
            .with_scheduler(clock),
    );
    c.bench_function("rate_limiter_offer", |b| {
        b.iter(|| l.maybe_execute(black_box(1)))
    });
}

fn bench_queuer_add_and_drain(c: &mut Criterion) {
    c.bench_function("queuer_add_and_drain_64", |b| {
        b.iter_batched(
            || {
                let clock = Arc::new(VirtualScheduler::new());
                Queuer::new(
                    |v: u64| {
                        black_box(v);
                    },
                    QueuerOptions::default()
                        .with_started(false)
                        .with_scheduler(clock),
                )
            },
            |q| {
                for v in 0..64u64 {
                    q.add_item(v);
                }
                q.flush();
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_batcher_size_trigger(c: &mut Criterion) {
    c.bench_function("batcher_fill_64_by_8", |b| {
        b.iter_batched(
            || {
                let clock = Arc::new(VirtualScheduler::new());
                Batcher::new(
                    |batch: Vec<u64>| {
                        black_box(batch.len());
                    },
                    BatcherOptions::default()
                        .with_max_size(8)
                        .with_scheduler(clock),
                )
            },
            |batcher| {
                for v in 0..64u64 {
                    batcher.add_item(v);
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_debouncer_offer,
    bench_throttler_offer,
    bench_rate_limiter_offer,
    bench_queuer_add_and_drain,
    bench_batcher_size_trigger,
);
criterion_main!(benches);
