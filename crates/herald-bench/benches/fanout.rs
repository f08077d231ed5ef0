//! Broker fan-out benchmarks.
//!
//! Each iteration publishes one event and waits until every subscribed
//! outbox has received and encoded it.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use herald_bench::{payload, receive_encoded, recipient, runtime, subscribed_broker};
use herald_core::Event;

fn bench_targeted(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fanout_targets");

    for targets in [1usize, 10, 100, 1000] {
        let (broker, mut outboxes) = rt.block_on(subscribed_broker(targets, 1));
        let names: Vec<String> = (0..targets).map(recipient).collect();
        let body = payload(64);

        group.throughput(Throughput::Elements(targets as u64));
        group.bench_with_input(BenchmarkId::from_parameter(targets), &targets, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let event = Event::new("bench", names.iter().cloned(), body.clone());
                    broker.publish(black_box(event)).await.unwrap();
                    black_box(receive_encoded(&mut outboxes).await)
                })
            })
        });
    }

    group.finish();
}

fn bench_connections_per_target(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fanout_connections");

    for per_target in [1usize, 8, 64] {
        let (broker, mut outboxes) = rt.block_on(subscribed_broker(1, per_target));
        let body = payload(256);

        group.throughput(Throughput::Elements(per_target as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(per_target),
            &per_target,
            |b, _| {
                b.iter(|| {
                    rt.block_on(async {
                        let event = Event::to("bench", recipient(0), body.clone());
                        broker.publish(black_box(event)).await.unwrap();
                        black_box(receive_encoded(&mut outboxes).await)
                    })
                })
            },
        );
    }

    group.finish();
}

fn bench_subscribe_churn(c: &mut Criterion) {
    let rt = runtime();
    let (broker, _outboxes) = rt.block_on(subscribed_broker(100, 1));

    c.bench_function("subscribe_churn", |b| {
        b.iter(|| {
            rt.block_on(async {
                let (connection, _outbox) = broker.connection(recipient(0));
                broker.add_client(connection.clone()).await.unwrap();
                broker.remove_client(connection).await.unwrap();
            })
        })
    });
}

criterion_group!(
    benches,
    bench_targeted,
    bench_connections_per_target,
    bench_subscribe_churn
);
criterion_main!(benches);
