use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::future::try_join_all;
use gapless::{Coordinator, CoordinatorConfig, InMemoryStore, SequenceRequest};
use std::{sync::Arc, time::Instant};
use tokio::runtime::{Builder, Runtime};

// Numbers allocated per benchmark iteration (per instance for multi-instance).
const TOTAL_NUMBERS: usize = 1024;

fn runtime(workers: usize) -> Runtime {
    Builder::new_multi_thread()
        .enable_all()
        .worker_threads(workers)
        .build()
        .unwrap()
}

fn request(count: u32) -> SequenceRequest {
    SequenceRequest::new("bench-site", "p0", "standard", count)
}

/// One instance allocating `batch` numbers per call.
fn bench_single_instance(c: &mut Criterion, group_name: &str, batch: u32) {
    let mut group = c.benchmark_group(group_name);
    group.throughput(Throughput::Elements(TOTAL_NUMBERS as u64));

    group.bench_function(format!("elems/{TOTAL_NUMBERS}"), |b| {
        let rt = runtime(1);
        b.to_async(&rt).iter_custom(|iters| async move {
            let store = Arc::new(InMemoryStore::new());
            let coordinator = Coordinator::start(store, CoordinatorConfig::for_node("bench"))
                .await
                .unwrap();
            let calls = TOTAL_NUMBERS / batch as usize;
            let start = Instant::now();

            for _ in 0..iters {
                for _ in 0..calls {
                    let response = coordinator.allocate(request(batch)).await.unwrap();
                    black_box(response.numbers);
                }
            }

            start.elapsed()
        });
    });

    group.finish();
}

/// `instances` coordinators sharing one store, racing on the counter.
fn bench_shared_store(c: &mut Criterion, group_name: &str, instances: usize) {
    let mut group = c.benchmark_group(group_name);
    group.throughput(Throughput::Elements((TOTAL_NUMBERS * instances) as u64));

    group.bench_function(format!("instances/{instances}"), |b| {
        let rt = runtime(instances);
        b.to_async(&rt).iter_custom(|iters| async move {
            let store = Arc::new(InMemoryStore::new());
            let mut coordinators = Vec::with_capacity(instances);
            for i in 0..instances {
                let config = CoordinatorConfig {
                    cas_retry_limit: u32::MAX,
                    ..CoordinatorConfig::for_node(format!("bench-{i}"))
                };
                coordinators.push(Arc::new(
                    Coordinator::start(Arc::clone(&store), config).await.unwrap(),
                ));
            }
            let start = Instant::now();

            for _ in 0..iters {
                let tasks = coordinators.iter().map(|coordinator| {
                    let coordinator = Arc::clone(coordinator);
                    tokio::spawn(async move {
                        for _ in 0..TOTAL_NUMBERS / 16 {
                            let response = coordinator.allocate(request(16)).await?;
                            black_box(response.numbers);
                        }
                        Ok::<_, gapless::Error>(())
                    })
                });
                for outcome in try_join_all(tasks).await.unwrap() {
                    outcome.unwrap();
                }
            }

            start.elapsed()
        });
    });

    group.finish();
}

fn benchmark_sequential_single(c: &mut Criterion) {
    bench_single_instance(c, "memory/sequential/count-1", 1);
}

fn benchmark_sequential_batch(c: &mut Criterion) {
    bench_single_instance(c, "memory/sequential/count-64", 64);
}

fn benchmark_shared_store(c: &mut Criterion) {
    bench_shared_store(c, "memory/shared/count-16", 4);
}

criterion_group!(
    benches,
    benchmark_sequential_single,
    benchmark_sequential_batch,
    benchmark_shared_store,
);
criterion_main!(benches);
