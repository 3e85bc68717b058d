//! Queue benchmarks using criterion.
//!
//! Measures uncontended offer/take and producer/consumer hand-off across
//! strategies and capacities.
//!
//! Run with: cargo bench --bench queue_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use skein_runtime::{Effect, Queue, Runtime};

const MESSAGES: u64 = 10_000;

fn runtime() -> Runtime {
    Runtime::builder().num_workers(4).build().expect("runtime")
}

/// Benchmark offer then take on one fiber
fn bench_uncontended(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("queue_uncontended");
    group.throughput(Throughput::Elements(MESSAGES));

    let queues = [
        ("unbounded", Queue::<u64>::unbounded()),
        ("sliding", Queue::sliding(64)),
        ("dropping", Queue::dropping(64)),
    ];
    for (name, queue) in queues {
        group.bench_function(name, |b| {
            b.iter(|| {
                let taker = queue.clone();
                let effect = Effect::for_each(0..MESSAGES, {
                    let queue = queue.clone();
                    move |n| queue.offer(n)
                })
                .zip_right(taker.take_all());
                black_box(rt.run_blocking(effect))
            });
        });
    }

    group.finish();
}

/// Benchmark a producer and a consumer on separate fibers
fn bench_back_pressure(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("queue_back_pressure");
    group.throughput(Throughput::Elements(MESSAGES));

    for capacity in [1usize, 16, 1_024] {
        group.bench_with_input(BenchmarkId::new("capacity", capacity), &capacity, |b, &capacity| {
            b.iter(|| {
                let queue: Queue<u64> = Queue::bounded(capacity);
                let producer = queue.clone();
                let consumer = queue.clone();
                let effect = Effect::for_each(0..MESSAGES, move |n| producer.offer(n))
                    .fork()
                    .zip_right(Effect::for_each(0..MESSAGES, move |_| consumer.take()));
                black_box(rt.run_blocking(effect))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_uncontended, bench_back_pressure);
criterion_main!(benches);
