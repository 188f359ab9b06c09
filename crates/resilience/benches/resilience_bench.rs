//! Resilience primitive benchmarks
//!
//! Benchmarks for the circuit breaker, bulkhead, and retry hot paths:
//! admission checks, state-machine transitions, checkout/checkin cycles,
//! and backoff calculation.
//!
//! Run with: `cargo bench --bench resilience_bench -p aegis-resilience`

use std::time::Duration;

use aegis_resilience::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, FailureKind, ResilienceError,
    RetryPolicy,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Builder as RuntimeBuilder;

// ============================================================================
// Circuit Breaker Benchmarks
// ============================================================================

fn bench_circuit_breaker_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker_paths");

    group.bench_function("call_success", |b| {
        let breaker = CircuitBreaker::with_defaults("bench");
        b.iter(|| {
            let result: Result<_, ResilienceError<std::io::Error>> =
                breaker.call(|| Ok::<_, std::io::Error>(()));
            if let Err(err) = result {
                panic!("circuit breaker success path failed: {err}");
            }
        });
    });

    group.bench_function("call_fail_to_open", |b| {
        b.iter(|| {
            let config = CircuitBreakerConfig::builder()
                .failure_threshold(5)
                .success_threshold(2)
                .open_timeout(Duration::from_secs(30))
                .build()
                .expect("valid circuit breaker config for benchmarks");
            let breaker = CircuitBreaker::new("bench", config)
                .expect("circuit breaker should build with benchmark configuration");

            for _ in 0..5 {
                let result: Result<_, ResilienceError<std::io::Error>> =
                    breaker.call(|| Err::<(), _>(std::io::Error::other("benchmark failure")));
                let _result = black_box(result);
            }

            black_box(breaker.get_state());
        });
    });

    group.bench_function("open_short_circuit", |b| {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .open_timeout(Duration::from_secs(60))
            .build()
            .expect("valid circuit breaker config for benchmarks");
        let breaker = CircuitBreaker::new("bench", config)
            .expect("circuit breaker should build for short-circuit");

        // Trip the breaker so it remains open for the benchmark iterations.
        let _ = breaker.call(|| Err::<(), _>(std::io::Error::other("initial failure")));

        b.iter(|| {
            let result: Result<_, ResilienceError<std::io::Error>> =
                breaker.call(|| Ok::<_, std::io::Error>(()));
            black_box(result.is_err());
        });
    });

    group.bench_function("is_available_probe", |b| {
        let breaker = CircuitBreaker::with_defaults("bench");
        b.iter(|| black_box(breaker.is_available()));
    });

    group.finish();
}

// ============================================================================
// Bulkhead Benchmarks
// ============================================================================

fn bench_bulkhead_checkout(c: &mut Criterion) {
    let runtime = RuntimeBuilder::new_current_thread()
        .enable_time()
        .build()
        .expect("benchmark runtime should build");

    let mut group = c.benchmark_group("bulkhead_checkout");

    group.bench_function("checkout_checkin_uncontended", |b| {
        let config = BulkheadConfig::builder()
            .max_concurrent(16)
            .max_waiting(16)
            .build()
            .expect("valid bulkhead config for benchmarks");
        let bulkhead = Bulkhead::new("bench", config).expect("bulkhead should build");

        b.iter(|| {
            runtime.block_on(async {
                let guard = bulkhead.checkout().await.expect("slot available");
                black_box(guard.slot());
                guard.release();
            });
        });
    });

    group.bench_function("try_checkout_exhausted", |b| {
        let config = BulkheadConfig::builder()
            .max_concurrent(1)
            .max_waiting(0)
            .build()
            .expect("valid bulkhead config for benchmarks");
        let bulkhead = Bulkhead::new("bench", config).expect("bulkhead should build");
        let _held = bulkhead.try_checkout().expect("first slot");

        b.iter(|| black_box(bulkhead.try_checkout().is_none()));
    });

    group.bench_function("metrics_snapshot", |b| {
        let bulkhead = Bulkhead::with_defaults("bench");
        b.iter(|| black_box(bulkhead.get_metrics().utilization()));
    });

    group.finish();
}

// ============================================================================
// Retry Benchmarks
// ============================================================================

fn bench_backoff_calculation(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_backoff");

    group.bench_function("exponential_no_jitter", |b| {
        let policy = RetryPolicy::builder()
            .base_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_secs(30))
            .no_jitter()
            .build()
            .expect("valid retry policy for benchmarks");

        b.iter(|| {
            for attempt in 1..=10u32 {
                black_box(policy.backoff_for(attempt, FailureKind::Connection));
            }
        });
    });

    group.bench_function("exponential_with_jitter", |b| {
        let policy = RetryPolicy::builder()
            .base_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_secs(30))
            .build()
            .expect("valid retry policy for benchmarks");

        b.iter(|| {
            for attempt in 1..=10u32 {
                black_box(policy.backoff_for(attempt, FailureKind::Connection));
            }
        });
    });

    group.bench_function("adaptive_kind_factors", |b| {
        let policy = RetryPolicy::adaptive();
        b.iter(|| {
            black_box(policy.backoff_for(3, FailureKind::Timeout));
            black_box(policy.backoff_for(3, FailureKind::Crash));
            black_box(policy.allowed_attempts(FailureKind::Timeout));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_circuit_breaker_paths,
    bench_bulkhead_checkout,
    bench_backoff_calculation
);
criterion_main!(benches);
