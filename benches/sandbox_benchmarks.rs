//! Benchmarks for the Python sandbox.
//!
//! Run with: cargo bench
//!
//! These benchmarks require a `python3` interpreter on `PATH`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use pyexec_sandbox_rs::prelude::*;

/// Build a sandbox, or `None` when no interpreter is available.
fn make_sandbox(max_sessions: usize) -> Option<PythonSandbox> {
    let policy = ExecutionPolicy::builder()
        .timeout(Duration::from_secs(30))
        .max_memory(256 * 1024 * 1024)
        .build();
    let sessions = SessionManagerConfig::builder()
        .max_sessions(max_sessions)
        .build();
    PythonSandbox::with_sessions(policy, sessions).ok()
}

/// Benchmark oneshot execution, one interpreter per call.
fn bench_oneshot(c: &mut Criterion) {
    let Some(sandbox) = make_sandbox(1) else {
        eprintln!("Skipping oneshot benchmark: python3 not found");
        return;
    };

    let rt = Runtime::new().unwrap();
    let options = ExecutionOptions::new();

    let mut group = c.benchmark_group("oneshot");
    group.sample_size(20);

    group.bench_function("simple_print", |b| {
        b.iter(|| {
            let result = rt.block_on(sandbox.execute_once("print(1 + 1)", &options)).unwrap();
            black_box(result)
        });
    });

    group.bench_function("loop_1000", |b| {
        b.iter(|| {
            let result = rt
                .block_on(sandbox.execute_once("sum(i * i for i in range(1000))", &options))
                .unwrap();
            black_box(result)
        });
    });

    group.finish();
}

/// Benchmark calls into an already-running session.
fn bench_session(c: &mut Criterion) {
    let Some(sandbox) = make_sandbox(4) else {
        eprintln!("Skipping session benchmark: python3 not found");
        return;
    };

    let rt = Runtime::new().unwrap();
    let options = ExecutionOptions::new();
    rt.block_on(sandbox.execute("bench", "total = 0", &options)).unwrap();

    let mut group = c.benchmark_group("session");

    group.bench_function("simple_print", |b| {
        b.iter(|| {
            let result = rt.block_on(sandbox.execute("bench", "print(1 + 1)", &options)).unwrap();
            black_box(result)
        });
    });

    group.bench_function("stateful_increment", |b| {
        b.iter(|| {
            let result = rt
                .block_on(sandbox.execute("bench", "total += 1\ntotal", &options))
                .unwrap();
            black_box(result)
        });
    });

    group.bench_function("large_output", |b| {
        b.iter(|| {
            let result = rt
                .block_on(sandbox.execute("bench", "print('x' * 100_000)", &options))
                .unwrap();
            black_box(result)
        });
    });

    group.finish();
    rt.block_on(sandbox.close_all());
}

/// Benchmark concurrent execution throughput across independent sessions.
fn bench_concurrent_sessions(c: &mut Criterion) {
    let Some(sandbox) = make_sandbox(8) else {
        eprintln!("Skipping concurrent benchmark: python3 not found");
        return;
    };

    let rt = Runtime::new().unwrap();
    let sandbox = Arc::new(sandbox);

    let mut group = c.benchmark_group("concurrent");
    group.sample_size(10);

    for concurrency in [1, 2, 4, 8].iter() {
        group.throughput(Throughput::Elements(*concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("sessions", concurrency),
            concurrency,
            |b, &concurrency| {
                b.iter(|| {
                    rt.block_on(async {
                        let mut handles = Vec::new();

                        for i in 0..concurrency {
                            let sandbox = Arc::clone(&sandbox);
                            let handle = tokio::spawn(async move {
                                let id = format!("worker-{i}");
                                sandbox
                                    .execute(&id, "print(1 + 1)", &ExecutionOptions::new())
                                    .await
                                    .unwrap()
                            });
                            handles.push(handle);
                        }

                        for handle in handles {
                            let result = handle.await.unwrap();
                            black_box(result);
                        }
                    });
                });
            },
        );
    }

    group.finish();
    rt.block_on(sandbox.close_all());
}

criterion_group!(benches, bench_oneshot, bench_session, bench_concurrent_sessions);

criterion_main!(benches);
