//! Benchmarks for the job service hot paths over the in-memory store.
//!
//! Benchmarks cover:
//! - Ready queue push/claim/finish
//! - Requeue of due scheduled records
//! - Tracker status transitions
//! - Cron enumeration over the enqueue horizon

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use prometheus_jobservice::config::LifecycleConfig;
use prometheus_jobservice::core::{JobStats, LifecycleController, Parameters, ParamValue, Status};
use prometheus_jobservice::infra::{InMemoryStore, JobRecord, Keys, SharedStore, WorkQueue};
use prometheus_jobservice::period::parse_cron;
use prometheus_jobservice::util::SystemClock;
use tokio::runtime::Runtime;

// ============================================================================
// Helper Functions
// ============================================================================

fn queue() -> WorkQueue {
    let store: SharedStore = Arc::new(InMemoryStore::new());
    WorkQueue::new(store, Keys::new("bench"))
}

fn record(i: u64) -> JobRecord {
    let mut args = Parameters::new();
    args.insert("repo".into(), ParamValue::from(format!("library/app-{i}")));
    JobRecord::new("scan-image", format!("job-{i}"), args, 0)
}

// ============================================================================
// Queue Benchmarks
// ============================================================================

fn bench_queue_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_push_pop");

    for size in [100_u64, 1_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let q = queue();
                for i in 0..size {
                    q.enqueue(&record(i), i64::try_from(i).unwrap()).await.unwrap();
                }
                while let Some(claim) = q.claim("bench-pool", 0).await.unwrap() {
                    q.finish("bench-pool", &claim.member).await.unwrap();
                    black_box(claim.record);
                }
            });
        });
    }
    group.finish();
}

fn bench_requeue_due(c: &mut Criterion) {
    let mut group = c.benchmark_group("requeue_due");

    for size in [100_u64, 1_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let q = queue();
                for i in 0..size {
                    q.schedule(&record(i), i64::try_from(i).unwrap()).await.unwrap();
                }
                let mut moved = 0;
                loop {
                    let n = q.requeue_due(i64::MAX, 0).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    moved += n;
                }
                black_box(moved);
            });
        });
    }
    group.finish();
}

// ============================================================================
// Tracker Benchmarks
// ============================================================================

fn bench_tracker_transitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker_transitions");

    group.bench_function("pending_running_success", |b| {
        b.to_async(Runtime::new().unwrap()).iter(|| async {
            let store: SharedStore = Arc::new(InMemoryStore::new());
            let ctl = LifecycleController::new(
                store,
                Keys::new("bench"),
                Arc::new(SystemClock),
                None,
                LifecycleConfig::default(),
            );
            let tracker = ctl
                .new_tracker(JobStats {
                    job_id: "job-1".into(),
                    job_name: "scan-image".into(),
                    status: Status::Pending,
                    ..JobStats::default()
                })
                .await
                .unwrap();
            tracker.run().await.unwrap();
            tracker.check_in("half way").await.unwrap();
            tracker.succeed().await.unwrap();
            black_box(tracker.cached_status());
        });
    });
    group.finish();
}

// ============================================================================
// Cron Benchmarks
// ============================================================================

fn bench_cron_horizon(c: &mut Criterion) {
    let mut group = c.benchmark_group("cron_horizon");
    let start = Utc.timestamp_opt(1_704_067_200, 0).unwrap();
    let end = start + chrono::TimeDelta::seconds(240);

    for spec in ["* * * * *", "*/5 * * * * *", "0 0 * * *"] {
        let schedule = parse_cron(spec).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(spec), &schedule, |b, schedule| {
            b.iter(|| {
                let fires = schedule.after(&start).take_while(|t| *t < end).count();
                black_box(fires);
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_queue_push_pop,
    bench_requeue_due,
    bench_tracker_transitions,
    bench_cron_horizon
);
criterion_main!(benches);
