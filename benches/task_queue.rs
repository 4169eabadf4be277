//! `.takt/tasks.yaml` read-modify-write performance benchmarks.
//!
//! Every queue operation re-reads, validates, and atomically rewrites the
//! whole file (spec §4.8); these benchmarks track how that cost scales with
//! queue depth.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use takt::domain::models::task::{TaskContent, TaskRecord};
use takt::domain::ports::task_store::TaskStore;
use takt::services::task_queue_service::YamlTaskStore;
use tempfile::tempdir;

fn seed(rt: &tokio::runtime::Runtime, store: &YamlTaskStore, count: usize) {
    rt.block_on(async {
        for i in 0..count {
            store
                .add_task(TaskRecord::new_pending(
                    format!("task-{i}"),
                    TaskContent::Text(format!("do thing {i}")),
                ))
                .await
                .unwrap();
        }
    });
}

fn bench_add_task(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("add_task");

    for depth in [0usize, 50, 500] {
        group.bench_with_input(BenchmarkId::new("existing_queue_depth", depth), &depth, |b, &depth| {
            b.iter_batched(
                || {
                    let dir = tempdir().unwrap();
                    let store = YamlTaskStore::for_project(dir.path());
                    seed(&rt, &store, depth);
                    (dir, store)
                },
                |(dir, store)| {
                    rt.block_on(async {
                        store
                            .add_task(TaskRecord::new_pending(
                                "new-task",
                                TaskContent::Text("fresh work".to_string()),
                            ))
                            .await
                            .unwrap();
                    });
                    black_box(dir);
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_claim_next_tasks(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("claim_next_tasks");

    for depth in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("pending_queue_depth", depth), &depth, |b, &depth| {
            b.iter_batched(
                || {
                    let dir = tempdir().unwrap();
                    let store = YamlTaskStore::for_project(dir.path());
                    seed(&rt, &store, depth);
                    (dir, store)
                },
                |(dir, store)| {
                    let claimed = rt.block_on(async { store.claim_next_tasks(5, 4242).await.unwrap() });
                    black_box((dir, claimed));
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_recover_interrupted(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("recover_interrupted_running_tasks");

    group.bench_function("100_running_no_owner", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let store = YamlTaskStore::for_project(dir.path());
                seed(&rt, &store, 100);
                rt.block_on(async { store.claim_next_tasks(100, 999_999).await.unwrap() });
                (dir, store)
            },
            |(dir, store)| {
                let recovered = rt.block_on(async { store.recover_interrupted_running_tasks().await.unwrap() });
                black_box((dir, recovered));
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_add_task, bench_claim_next_tasks, bench_recover_interrupted);
criterion_main!(benches);
