// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exponential backoff and the request-level retry policy.
//!
//! [`Backoff`] is the one backoff calculation used across Folio: the
//! connection manager uses it with ±25% jitter for connection establishment,
//! and [`with_retry`] uses it without jitter for individual storage
//! operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use folio_cancel::CancellationToken;
use folio_error::{ErrorCode, Failure, TypedError, normalize};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ── Backoff ─────────────────────────────────────────────────────────

/// Exponential backoff with optional symmetric jitter.
///
/// For the 1-based attempt `n` the nominal delay is
/// `min(base * 2^(n-1), max)`; the jittered delay multiplies that by
/// `1 + U(-jitter, jitter)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay after the first failure.
    #[serde(with = "duration_millis")]
    pub base: Duration,
    /// Cap applied before jitter.
    #[serde(with = "duration_millis")]
    pub max: Duration,
    /// Jitter spread in `[0.0, 1.0)`; `0.25` means ±25%.
    pub jitter: f64,
}

impl Backoff {
    /// A `max` that never limits the schedule. It survives the millisecond
    /// serde encoding unchanged.
    pub const UNCAPPED: Duration = Duration::from_millis(u64::MAX);

    /// Backoff without jitter.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Set the jitter spread (clamped to `[0.0, 0.99]`).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }

    /// Capped delay before jitter for the 1-based `attempt`.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(exp).min(self.max)
    }

    /// Delay for `attempt` using `factor` in `[-1.0, 1.0]` as the unit jitter
    /// sample, scaled by [`jitter`](Self::jitter).
    pub fn delay_with(&self, attempt: u32, factor: f64) -> Duration {
        let nominal = self.nominal(attempt);
        let spread = self.jitter.clamp(0.0, 0.99);
        if spread == 0.0 {
            return nominal;
        }
        let scale = 1.0 + factor.clamp(-1.0, 1.0) * spread;
        nominal.mul_f64(scale)
    }

    /// Delay for `attempt` with a uniformly random jitter sample.
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.jitter <= 0.0 {
            return self.nominal(attempt);
        }
        let factor = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with(attempt, factor)
    }

    /// Inclusive bounds any [`delay`](Self::delay) for `attempt` falls within.
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        (self.delay_with(attempt, -1.0), self.delay_with(attempt, 1.0))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Serde helper: `Duration` as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        (val.as_millis() as u64).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

// ── Policy ──────────────────────────────────────────────────────────

/// Retry policy for a single caller-supplied operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. `0` is treated as `1`.
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Policy with `max_attempts` and an un-jittered, uncapped
    /// `base * 2^(n-1)` schedule. Set `backoff.max` to bound it.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::exponential(base_delay, Backoff::UNCAPPED),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000))
    }
}

// ── Metadata ────────────────────────────────────────────────────────

/// Record of a single failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Normalized code of the failure.
    pub code: ErrorCode,
    /// Delay slept before the next attempt.
    #[serde(with = "duration_millis")]
    pub delay: Duration,
}

/// What happened across all attempts of a successful operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryMetadata {
    /// Attempts made, including the successful one.
    pub total_attempts: u32,
    /// Each failed attempt in order.
    pub failed_attempts: Vec<RetryAttempt>,
    /// Wall-clock time across all attempts.
    #[serde(with = "duration_millis")]
    pub total_duration: Duration,
}

/// Result of [`with_retry_outcome`].
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The produced value.
    pub value: T,
    /// Attempt bookkeeping.
    pub metadata: RetryMetadata,
}

// ── Retry loop ──────────────────────────────────────────────────────

/// Run `op`, retrying only while its failure normalizes to `retryable`.
///
/// Non-retryable failures and the failure of the final attempt propagate
/// immediately as the normalized [`TypedError`]. Sleeps between attempts
/// race `cancel`; a cancelled token stops further attempts with
/// `OPERATION_CANCELLED`.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: F,
) -> Result<T, TypedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<Failure>,
{
    with_retry_outcome(policy, cancel, op)
        .await
        .map(|outcome| outcome.value)
}

/// Like [`with_retry`], also returning per-attempt metadata.
pub async fn with_retry_outcome<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<RetryOutcome<T>, TypedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<Failure>,
{
    let start = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut failed_attempts = Vec::new();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(cancelled_error(attempt - 1));
        }

        debug!(target: "folio.retry", attempt, max_attempts, "attempting operation");

        let err = match op().await {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    metadata: RetryMetadata {
                        total_attempts: attempt,
                        failed_attempts,
                        total_duration: start.elapsed(),
                    },
                });
            }
            Err(e) => normalize(e),
        };

        if !err.is_retryable() {
            debug!(target: "folio.retry", code = %err.code(), attempt, "non-retryable error, giving up");
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(target: "folio.retry", code = %err.code(), attempt, "max attempts exhausted");
            return Err(err);
        }

        let delay = policy.backoff.delay(attempt);
        let delay_ms = delay.as_millis() as u64;
        warn!(
            target: "folio.retry",
            code = %err.code(),
            attempt,
            delay_ms,
            "retryable error, backing off"
        );
        failed_attempts.push(RetryAttempt {
            attempt,
            code: err.code(),
            delay,
        });

        if cancel
            .run_until_cancelled(tokio::time::sleep(delay))
            .await
            .is_none()
        {
            return Err(cancelled_error(attempt));
        }
    }
}

fn cancelled_error(attempts: u32) -> TypedError {
    TypedError::new(ErrorCode::OperationCancelled, "operation cancelled during retry")
        .with_detail("attempts", attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_doubles_and_caps() {
        let b = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(b.nominal(1), Duration::from_secs(1));
        assert_eq!(b.nominal(2), Duration::from_secs(2));
        assert_eq!(b.nominal(3), Duration::from_secs(4));
        assert_eq!(b.nominal(5), Duration::from_secs(16));
        assert_eq!(b.nominal(6), Duration::from_secs(30));
        assert_eq!(b.nominal(60), Duration::from_secs(30));
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        let b = Backoff::default();
        assert_eq!(b.nominal(0), b.nominal(1));
    }

    #[test]
    fn no_jitter_is_deterministic() {
        let b = Backoff::default();
        for attempt in 1..8 {
            assert_eq!(b.delay(attempt), b.nominal(attempt));
        }
    }

    #[test]
    fn jitter_extremes() {
        let b = Backoff::default().with_jitter(0.25);
        assert_eq!(b.delay_with(1, -1.0), Duration::from_millis(750));
        assert_eq!(b.delay_with(1, 1.0), Duration::from_millis(1250));
        assert_eq!(b.delay_with(3, 0.0), Duration::from_secs(4));
    }

    #[test]
    fn jitter_is_applied_after_cap() {
        let b = Backoff::default().with_jitter(0.25);
        let (lo, hi) = b.bounds(10);
        assert_eq!(lo, Duration::from_millis(22_500));
        assert_eq!(hi, Duration::from_millis(37_500));
    }

    #[test]
    fn policy_defaults() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.backoff.base, Duration::from_millis(1000));
        assert_eq!(p.backoff.jitter, 0.0);
    }

    #[test]
    fn policy_schedule_is_uncapped() {
        let p = RetryPolicy::new(8, Duration::from_secs(10));
        assert_eq!(p.backoff.nominal(4), Duration::from_secs(80));
        assert_eq!(p.backoff.nominal(7), Duration::from_secs(640));
        assert_eq!(p.backoff.delay(7), Duration::from_secs(640));
        assert!(p.backoff.nominal(200) > Duration::from_secs(u64::from(u32::MAX)));
    }

    #[test]
    fn policy_serde_roundtrip() {
        let p = RetryPolicy::new(4, Duration::from_millis(250));
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"base\":250"));
        let back: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
