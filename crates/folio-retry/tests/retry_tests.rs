// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tests for `folio_retry::with_retry` and the shared backoff.

use folio_cancel::CancellationToken;
use folio_error::{ErrorCode, Failure, TypedError};
use folio_retry::{Backoff, RetryPolicy, with_retry, with_retry_outcome};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn transient() -> Failure {
    Failure::StorageTimeout {
        operation: "projects.update".into(),
    }
}

fn counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

// ---------------------------------------------------------------------------
// Attempt counting
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn non_retryable_error_makes_exactly_one_attempt() {
    let calls = counter();
    let c = calls.clone();
    let result: Result<(), TypedError> = with_retry(
        &RetryPolicy::default(),
        &CancellationToken::new(),
        move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TypedError::new(ErrorCode::ValidationFailed, "bad email"))
            }
        },
    )
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationFailed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn succeeds_on_third_attempt() {
    let calls = counter();
    let c = calls.clone();
    let policy = RetryPolicy::new(3, Duration::from_millis(1000));
    let outcome = with_retry_outcome(&policy, &CancellationToken::new(), move || {
        let c = c.clone();
        async move {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err(transient()) } else { Ok("saved") }
        }
    })
    .await
    .unwrap();

    assert_eq!(outcome.value, "saved");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.metadata.total_attempts, 3);
    let delays: Vec<Duration> = outcome
        .metadata
        .failed_attempts
        .iter()
        .map(|a| a.delay)
        .collect();
    assert_eq!(
        delays,
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );
}

#[tokio::test(start_paused = true)]
async fn final_attempt_failure_propagates_normalized_error() {
    let calls = counter();
    let c = calls.clone();
    let result: Result<(), _> = with_retry(
        &RetryPolicy::new(3, Duration::from_millis(10)),
        &CancellationToken::new(),
        move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            }
        },
    )
    .await;
    let err = result.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DbOperationTimeout);
    assert!(err.is_retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn zero_max_attempts_still_runs_once() {
    let calls = counter();
    let c = calls.clone();
    let _ = with_retry(
        &RetryPolicy::new(0, Duration::from_millis(10)),
        &CancellationToken::new(),
        move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            }
        },
    )
    .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn sleeps_follow_exponential_schedule() {
    let start = Instant::now();
    let _ = with_retry(
        &RetryPolicy::new(4, Duration::from_millis(100)),
        &CancellationToken::new(),
        || async { Err::<(), _>(transient()) },
    )
    .await;
    // 100 + 200 + 400
    assert_eq!(start.elapsed(), Duration::from_millis(700));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_stops_retries() {
    let calls = counter();
    let c = calls.clone();
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    let result: Result<(), _> = with_retry(
        &RetryPolicy::new(5, Duration::from_secs(10)),
        &cancel,
        move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            }
        },
    )
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.code(), ErrorCode::OperationCancelled);
    assert!(!err.is_retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn already_cancelled_token_makes_no_attempt() {
    let calls = counter();
    let c = calls.clone();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result: Result<(), _> = with_retry(&RetryPolicy::default(), &cancel, move || {
        let c = c.clone();
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok::<(), Failure>(())
        }
    })
    .await;
    assert_eq!(result.unwrap_err().code(), ErrorCode::OperationCancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn jittered_delay_within_bounds(attempt in 1u32..12, base_ms in 1u64..5_000) {
        let backoff = Backoff::exponential(
            Duration::from_millis(base_ms),
            Duration::from_secs(30),
        )
        .with_jitter(0.25);
        let nominal = backoff.nominal(attempt);
        let delay = backoff.delay(attempt);
        prop_assert!(delay >= nominal.mul_f64(0.75));
        prop_assert!(delay <= nominal.mul_f64(1.25));
    }

    #[test]
    fn nominal_never_exceeds_cap(attempt in 0u32..64, base_ms in 1u64..60_000) {
        let backoff = Backoff::exponential(
            Duration::from_millis(base_ms),
            Duration::from_secs(30),
        );
        prop_assert!(backoff.nominal(attempt) <= Duration::from_secs(30));
    }
}
