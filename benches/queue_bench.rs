//! Benchmarks for Courier event queues and dispatch
//!
//! Run with: cargo bench

use chrono::Utc;
use courier::events::*;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use serde_json::json;

fn typing_events(count: usize) -> Vec<Event> {
    (0..count)
        .map(|i| Event::new("typing").with("op", "start").with("sender", i))
        .collect()
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    for size in [100, 1000, 10000] {
        let events = typing_events(size);

        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("push_{}", size), |b| {
            b.iter(|| {
                let mut queue = EventQueue::new("1:0");
                for event in &events {
                    queue.push(black_box(event.clone()));
                }
                queue
            })
        });

        group.bench_function(format!("push_prune_half_{}", size), |b| {
            b.iter(|| {
                let mut queue = EventQueue::new("1:0");
                for event in &events {
                    queue.push(event.clone());
                }
                queue.prune(black_box(size as u64 / 2));
                queue.contents()
            })
        });
    }

    group.finish();
}

fn bench_collapse(c: &mut Criterion) {
    let mut group = c.benchmark_group("collapse");

    group.bench_function("pointer_1000", |b| {
        b.iter(|| {
            let mut queue = EventQueue::new("1:0");
            for i in 0..1000 {
                queue.push(Event::new("pointer").with("pointer", black_box(i)));
            }
            queue.contents()
        })
    });

    group.bench_function("flags_add_1000", |b| {
        b.iter(|| {
            let mut queue = EventQueue::new("1:0");
            for i in 0..1000 {
                queue.push(
                    Event::new("update_message_flags")
                        .with("operation", "add")
                        .with("flag", "read")
                        .with("messages", json!([black_box(i)])),
                );
            }
            queue.contents()
        })
    });

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    for users in [10u64, 100, 1000] {
        let audience: Vec<UserId> = (0..users).collect();
        let populated = || {
            let mut registry = Registry::new(1, QueueLimits::default());
            for user in 0..users {
                registry.allocate(user, 1, QueueOptions::default(), Utc::now());
            }
            registry
        };

        group.throughput(Throughput::Elements(users));

        group.bench_function(format!("simple_{}", users), |b| {
            b.iter_batched(
                populated,
                |mut registry| {
                    registry.dispatch(Notice::Simple {
                        event: Event::new("presence").with("status", "active"),
                        users: black_box(audience.clone()),
                    })
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_queue, bench_collapse, bench_dispatch);
criterion_main!(benches);
