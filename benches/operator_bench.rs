// SPDX-License-Identifier: MIT OR Apache-2.0

//! Operator throughput benchmarks
//!
//! Compares the fused and unfused paths of synchronous chains and measures
//! the cost of the queue-based operators.
//!
//! Run with: cargo bench --bench operator_bench

use std::hint::black_box;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use backflow::core::protocol::{FusionMode, UNBOUNDED};
use backflow::{schedulers, Flowable};

const ITEMS: i32 = 100_000;

/// Subscribe with a summing consumer and return the total
fn drain(flow: &Flowable<i32>) -> i64 {
    let sum = Arc::new(AtomicI64::new(0));
    let s = Arc::clone(&sum);
    flow.subscribe_with(
        move |v| {
            s.fetch_add(i64::from(v), Ordering::Relaxed);
        },
        |_| {},
        || {},
    );
    sum.load(Ordering::Relaxed)
}

fn bench_map_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_filter");
    group.throughput(Throughput::Elements(ITEMS as u64));
    let chain = Flowable::range(0, ITEMS).map(|v| v + 1).filter(|v| v % 2 == 0);

    group.bench_function("unfused", |b| b.iter(|| black_box(drain(&chain))));
    group.bench_function("fused_sync", |b| {
        b.iter(|| {
            let ts = chain.test_fused(FusionMode::SYNC, UNBOUNDED);
            black_box(ts.value_count())
        })
    });
    group.finish();
}

fn bench_flat_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("flat_map");
    group.throughput(Throughput::Elements(ITEMS as u64));
    for concurrency in [1usize, 4, 32] {
        let chain = Flowable::range(0, ITEMS / 10).flat_map(|v| Flowable::range(v, 10), concurrency);
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &chain,
            |b, chain| b.iter(|| black_box(drain(chain))),
        );
    }
    group.finish();
}

fn bench_zip_and_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_source");
    group.throughput(Throughput::Elements(ITEMS as u64));

    let zipped = Flowable::range(0, ITEMS).zip_with(&Flowable::range(0, ITEMS), |a, b| a ^ b);
    group.bench_function("zip_with", |b| b.iter(|| black_box(drain(&zipped))));

    let published = Flowable::range(0, ITEMS).publish(|f| Ok(f.map(|v| v + 1)));
    group.bench_function("publish", |b| b.iter(|| black_box(drain(&published))));
    group.finish();
}

fn bench_observe_on(c: &mut Criterion) {
    let mut group = c.benchmark_group("observe_on");
    group.throughput(Throughput::Elements(ITEMS as u64));
    group.measurement_time(Duration::from_secs(10));
    let chain = Flowable::range(0, ITEMS).observe_on(schedulers::computation());
    group.bench_function("computation", |b| {
        b.iter(|| {
            let ts = chain.test();
            ts.await_done(Duration::from_secs(30));
            black_box(ts.value_count())
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_map_filter,
    bench_flat_map,
    bench_zip_and_publish,
    bench_observe_on,
);
criterion_main!(benches);
