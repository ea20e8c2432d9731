//! Benchmarks for the scheduler hot path using criterion.
//!
//! - Submission with identity deduplication
//! - Claim and finish cycles over a backlog, inline and through the worker
//!   pool

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anisync::{
    InProcEventBus, JobDescriptor, JobRegistry, MemoryJobStore, Priority, ProcessLock, Scheduler,
    SchedulerConfig, SchedulerRuntimeBuilder, SchedulerRuntimeConfig, SystemClock,
};
use anisync_testkit::{aid, run_once, RecordingExecutor};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn registry() -> JobRegistry {
    JobRegistry::builder()
        .register(
            JobDescriptor::new("bench").key_field("aid").max_concurrent(64),
            RecordingExecutor::new(),
        )
        .build()
        .expect("registry")
}

fn scheduler() -> Scheduler {
    Scheduler::new(
        SchedulerConfig::default(),
        Arc::new(registry()),
        Arc::new(MemoryJobStore::new()),
        Arc::new(ProcessLock::default()),
        Arc::new(SystemClock),
        InProcEventBus::new(16),
    )
}

/// Benchmark: submit fresh and duplicate identities.
fn bench_submit(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("submit");
    group.throughput(Throughput::Elements(1));

    group.bench_function("fresh", |b| {
        let scheduler = scheduler();
        let mut next = 0u64;
        b.to_async(&rt).iter(|| {
            next += 1;
            let input = aid(next);
            let scheduler = &scheduler;
            async move {
                scheduler
                    .submit("bench", input, Priority::NORMAL)
                    .await
                    .expect("submit")
            }
        });
    });

    group.bench_function("duplicate", |b| {
        let scheduler = scheduler();
        rt.block_on(scheduler.submit("bench", aid(1), Priority::HIGH))
            .expect("seed");
        b.to_async(&rt).iter(|| async {
            scheduler
                .submit("bench", aid(1), Priority::NORMAL)
                .await
                .expect("submit")
        });
    });

    group.finish();
}

/// Benchmark: drain a backlog by claiming and finishing inline.
fn bench_claim_cycle(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("claim_cycle");
    group.sample_size(20);

    for backlog in [100usize, 1_000] {
        group.throughput(Throughput::Elements(backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &backlog| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let scheduler = scheduler();
                    for id in 0..backlog as u64 {
                        scheduler
                            .submit("bench", aid(id), Priority::NORMAL)
                            .await
                            .expect("submit");
                    }

                    let start = Instant::now();
                    while run_once(&scheduler, "bench-w0").await.expect("cycle").is_some() {}
                    total += start.elapsed();
                }
                total
            });
        });
    }

    group.finish();
}

/// Benchmark: drain a backlog through the worker pool.
fn bench_worker_pool(c: &mut Criterion) {
    let rt = create_runtime();
    const JOBS: u64 = 500;

    let mut group = c.benchmark_group("worker_pool");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(20));
    group.throughput(Throughput::Elements(JOBS));

    for workers in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let runtime = SchedulerRuntimeBuilder::new(SchedulerRuntimeConfig {
                        poll_interval_ms: 1,
                        ..SchedulerRuntimeConfig::default()
                    })
                    .with_registry(registry())
                    .with_store(Arc::new(MemoryJobStore::new()))
                    .workers(workers)
                    .build()
                    .expect("runtime");
                    let scheduler = runtime.scheduler();
                    for id in 0..JOBS {
                        scheduler
                            .submit("bench", aid(id), Priority::NORMAL)
                            .await
                            .expect("submit");
                    }

                    let start = Instant::now();
                    runtime.start().await.expect("start runtime");
                    while scheduler.snapshot().await.expect("snapshot").active() > 0 {
                        tokio::task::yield_now().await;
                    }
                    total += start.elapsed();
                    runtime.shutdown().await.expect("shutdown");
                }
                total
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_submit, bench_claim_cycle, bench_worker_pool);
criterion_main!(benches);
