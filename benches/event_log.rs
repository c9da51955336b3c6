//! Benchmarks for repository operations on the in-memory event log.
//!
//! The number of entities is taken from `BENCHMARK_ENTITY_VOLUME_COUNT`
//! (default 128).
//!
//! Run with: `cargo bench --features test-util`

use std::sync::OnceLock;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use memlog::{
    Context, Entity, EventLog, Repository, Subscriber, TxManager,
    test::benchmark_entity_volume_count,
};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

#[derive(Debug, Clone, Serialize, Deserialize, Entity)]
struct Reading {
    id: String,
    sensor: String,
    value: f64,
}

#[allow(clippy::cast_precision_loss)]
fn reading(n: usize) -> Reading {
    Reading {
        id: String::new(),
        sensor: format!("sensor-{}", n % 16),
        value: n as f64,
    }
}

fn get_runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| Runtime::new().expect("Failed to create Tokio runtime"))
}

/// Repository pre-populated with `count` readings; returns their IDs too.
fn populated(log: &EventLog, count: usize) -> (Repository<Reading, String>, Vec<String>) {
    let repo = Repository::new(log);
    let ctx = Context::background();
    let ids = get_runtime().block_on(async {
        let mut ids = Vec::with_capacity(count);
        for n in 0..count {
            let mut reading = reading(n);
            repo.create(&ctx, &mut reading).await.unwrap();
            ids.push(reading.id);
        }
        ids
    });
    (repo, ids)
}

fn bench_create(c: &mut Criterion) {
    let rt = get_runtime();
    let count = benchmark_entity_volume_count();

    let mut group = c.benchmark_group("create");
    group.throughput(Throughput::Elements(count as u64));

    group.bench_function(BenchmarkId::new("root", count), |b| {
        b.iter(|| {
            let log = EventLog::new();
            let repo: Repository<Reading, _> = Repository::new(&log);
            let ctx = Context::background();
            rt.block_on(async {
                for n in 0..count {
                    repo.create(&ctx, &mut reading(n)).await.unwrap();
                }
            });
        });
    });

    group.bench_function(BenchmarkId::new("single_transaction", count), |b| {
        b.iter(|| {
            let log = EventLog::new();
            let repo: Repository<Reading, _> = Repository::new(&log);
            let ctx = Context::background();
            rt.block_on(async {
                let tx = repo.begin_tx(&ctx).await.unwrap();
                for n in 0..count {
                    repo.create(&tx, &mut reading(n)).await.unwrap();
                }
                repo.commit_tx(&tx).await.unwrap();
            });
        });
    });

    group.finish();
}

fn bench_reads(c: &mut Criterion) {
    let rt = get_runtime();
    let count = benchmark_entity_volume_count();
    let log = EventLog::new();
    let (repo, ids) = populated(&log, count);
    let ctx = Context::background();

    let mut group = c.benchmark_group("read");
    group.throughput(Throughput::Elements(1));

    group.bench_function(BenchmarkId::new("find_by_id", count), |b| {
        let mut idx = 0;
        b.to_async(rt).iter(|| {
            let id = &ids[idx % ids.len()];
            idx += 1;
            let repo = &repo;
            let ctx = &ctx;
            async move { repo.find_by_id(ctx, id).await.unwrap() }
        });
    });

    group.bench_function(BenchmarkId::new("find_all", count), |b| {
        b.iter(|| rt.block_on(async { repo.find_all(&ctx).await.unwrap().count() }));
    });

    let tx = rt.block_on(repo.begin_tx(&ctx)).unwrap();
    group.bench_function(BenchmarkId::new("find_all_in_transaction", count), |b| {
        b.iter(|| rt.block_on(async { repo.find_all(&tx).await.unwrap().count() }));
    });
    rt.block_on(repo.rollback_tx(&tx)).unwrap();

    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let rt = get_runtime();
    let count = benchmark_entity_volume_count();

    let mut group = c.benchmark_group("fan_out");
    group.throughput(Throughput::Elements(count as u64));

    for subscribers in [1, 4, 16] {
        group.bench_with_input(
            BenchmarkId::new("sync_subscribers", subscribers),
            &subscribers,
            |b, &subscribers| {
                b.iter(|| {
                    let log = EventLog::builder()
                        .disable_async_subscription_handling(true)
                        .build();
                    let repo: Repository<Reading, _> = Repository::new(&log);
                    let ctx = Context::background();
                    rt.block_on(async {
                        let mut handles = Vec::with_capacity(subscribers);
                        for _ in 0..subscribers {
                            let subscriber =
                                Subscriber::new().on_create(|_ctx, _event| async { Ok(()) });
                            let subscription = repo.subscribe(&ctx, subscriber).await.unwrap();
                            handles.push(subscription);
                        }
                        for n in 0..count {
                            repo.create(&ctx, &mut reading(n)).await.unwrap();
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

fn bench_compaction(c: &mut Criterion) {
    let count = benchmark_entity_volume_count();

    let mut group = c.benchmark_group("compaction");
    group.throughput(Throughput::Elements(count as u64));

    group.bench_function(BenchmarkId::new("half_deleted", count), |b| {
        b.iter_batched(
            || {
                let log = EventLog::new();
                let (repo, ids) = populated(&log, count);
                let ctx = Context::background();
                get_runtime().block_on(async {
                    for id in ids.iter().step_by(2) {
                        repo.delete_by_id(&ctx, id).await.unwrap();
                    }
                });
                log
            },
            |log| log.compact("reading"),
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_create,
    bench_reads,
    bench_fan_out,
    bench_compaction
);
criterion_main!(benches);
