use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use filament::{yield_now, Baton, FiberManager, FiberManagerOptions, SimpleLoopController};

fn manager(initial_pool_size: usize) -> FiberManager {
    let options = FiberManagerOptions::new()
        .with_stack_size(64 * 1024)
        .with_initial_pool_size(initial_pool_size);
    FiberManager::with_options(Arc::new(SimpleLoopController::new()), options)
}

fn bench_add_task(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_task");

    for tasks in [1usize, 100, 1000] {
        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_with_input(BenchmarkId::new("pooled", tasks), &tasks, |b, &tasks| {
            let manager = manager(tasks);
            let counter = Rc::new(Cell::new(0u64));
            b.iter(|| {
                for _ in 0..tasks {
                    let counter = counter.clone();
                    manager.add_task(move || counter.set(counter.get() + 1));
                }
                manager.loop_until_no_ready();
            });
            black_box(counter.get());
        });
    }

    group.finish();
}

fn bench_large_closure(c: &mut Criterion) {
    let manager = manager(1);
    let payload = [1u8; 1024];

    c.bench_function("add_task_boxed_closure", |b| {
        b.iter(|| {
            let payload = black_box(payload);
            manager.add_task(move || {
                black_box(payload.len());
            });
            manager.loop_until_no_ready();
        });
    });
}

fn bench_yield(c: &mut Criterion) {
    let manager = manager(2);

    c.bench_function("yield_ping_pong", |b| {
        b.iter(|| {
            for _ in 0..2 {
                manager.add_task(|| {
                    for _ in 0..50 {
                        yield_now().unwrap();
                    }
                });
            }
            manager.loop_until_no_ready();
        });
    });
}

fn bench_baton_handoff(c: &mut Criterion) {
    let manager = manager(2);

    c.bench_function("baton_handoff", |b| {
        b.iter(|| {
            let baton = Rc::new(Baton::new());
            let waiter = baton.clone();
            manager.add_task(move || waiter.wait());
            manager.add_task(move || baton.post());
            manager.loop_until_no_ready();
        });
    });
}

fn bench_remote_submission(c: &mut Criterion) {
    let manager = manager(1);
    let remote = manager.remote_handle();

    c.bench_function("remote_submission_100", |b| {
        b.iter(|| {
            for i in 0..100u64 {
                remote.add_task_remote(move || {
                    black_box(i);
                });
            }
            manager.loop_until_no_ready();
        });
    });
}

criterion_group!(
    benches,
    bench_add_task,
    bench_large_closure,
    bench_yield,
    bench_baton_handoff,
    bench_remote_submission
);
criterion_main!(benches);
