// packages/engine/tests/retry_behavior.rs
//! Retry engine behavior through the public API

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenant_engine::resilience::{
    BackoffStrategy, BreakerRegistry, CircuitBreaker, CircuitState, DefaultCircuitBreaker,
    ErrorKind, RetryEngine, RetryError, RetryPolicy,
};

fn policy(attempts: u32) -> RetryPolicy {
    RetryPolicy::builder("integration")
        .max_attempts(attempts)
        .base_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(100))
        .strategy(BackoffStrategy::Exponential)
        .build()
        .unwrap()
}

fn connection_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
}

#[tokio::test]
async fn test_fail_once_then_succeed() {
    let engine = RetryEngine::new(policy(3)).unwrap();
    let calls = AtomicU32::new(0);

    let result = engine
        .execute(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(connection_error())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

    assert!(result.is_success());
    assert_eq!(result.value(), Some(&"done"));
    assert_eq!(result.total_attempts(), 2);

    let attempts = result.attempts();
    assert_eq!(attempts[0].error_kind, Some(ErrorKind::Connection));
    assert_eq!(attempts[1].delay_before_attempt, Duration::from_millis(10));
    assert!(attempts[1].succeeded());
}

#[tokio::test]
async fn test_non_retryable_error_makes_one_attempt() {
    let policy = RetryPolicy::builder("strict")
        .max_attempts(5)
        .base_delay(Duration::from_millis(1))
        .never_retry_on(ErrorKind::PermissionDenied)
        .build()
        .unwrap();
    let engine = RetryEngine::new(policy).unwrap();
    let calls = AtomicU32::new(0);

    let result = engine
        .execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(io::Error::new(io::ErrorKind::PermissionDenied, "nope")) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.total_attempts(), 1);
    assert!(matches!(result.final_error(), Some(RetryError::Operation(_))));
}

#[tokio::test]
async fn test_attempts_never_exceed_max() {
    for max in 1..=4 {
        let engine = RetryEngine::new(policy(max)).unwrap();
        let calls = AtomicU32::new(0);

        let result = engine
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(connection_error()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), max);
        assert_eq!(result.total_attempts(), max as usize);
        assert!(result.is_failure());
    }
}

#[tokio::test]
async fn test_open_breaker_makes_zero_attempts() {
    let breaker = Arc::new(DefaultCircuitBreaker::new(
        "payments",
        1,
        Duration::from_secs(60),
    ));
    breaker.record_failure(ErrorKind::ServerError);
    assert_eq!(breaker.state(), CircuitState::Open);

    let engine = RetryEngine::new(policy(3)).unwrap().with_breaker(breaker);
    let calls = AtomicU32::new(0);

    let result = engine
        .execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, io::Error>(()) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.total_attempts(), 0);
    assert!(result.final_error().unwrap().is_circuit_open());
}

#[tokio::test]
async fn test_registry_breakers_shared_by_name() {
    let registry = BreakerRegistry::new();
    let policy = RetryPolicy::builder("inventory")
        .max_attempts(1)
        .circuit_breaker(2, Duration::from_secs(60))
        .build()
        .unwrap();

    let first = RetryEngine::with_registry(policy.clone(), &registry).unwrap();
    let second = RetryEngine::with_registry(policy, &registry).unwrap();

    for engine in [&first, &second] {
        let result = engine
            .execute(|| async { Err::<(), _>(connection_error()) })
            .await;
        assert!(result.is_failure());
    }

    let status = registry.statuses();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].state, CircuitState::Open);
}

#[test]
fn test_blocking_fail_once() {
    let engine = RetryEngine::new(policy(3)).unwrap();
    let mut calls = 0;

    let result = engine.execute_blocking(|| {
        calls += 1;
        if calls == 1 {
            Err(connection_error())
        } else {
            Ok(calls)
        }
    });

    assert_eq!(result.into_result().unwrap(), 2);
}
