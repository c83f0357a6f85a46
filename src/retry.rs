//! Retry with a failure classifier and a backoff schedule.
//!
//! Every remote call site that needs more than the single token-refresh retry
//! goes through [`retry_with`]: the caller supplies the operation, a
//! classifier mapping each error to a [`FailureType`], and a [`RetryPolicy`]
//! describing how many attempts to make and how long to wait between them.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use rehoster_core::retry::{FailureType, RetryPolicy, retry_with};
//!
//! # async fn example() {
//! let policy = RetryPolicy::linear(3, Duration::from_millis(1));
//! let result: Result<u32, _> = retry_with(
//!     &policy,
//!     |_: &String| FailureType::Transient,
//!     |attempt| async move {
//!         if attempt < 3 { Err(format!("attempt {attempt} failed")) } else { Ok(attempt) }
//!     },
//! )
//! .await;
//! assert_eq!(result.unwrap(), 3);
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, instrument};

/// Default maximum attempts for exponential policies.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to exponential delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Upper bound for a server-mandated `Retry-After` delay.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry (network, 5xx).
    Transient,

    /// Failure that retrying cannot fix (not found, bad request, ACL).
    Permanent,

    /// Quota or rate limiting; retried with backoff.
    RateLimited,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number comes next (1-indexed).
        attempt: u32,
    },

    /// Give up.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// `min(base * multiplier^(attempt-1), max) + jitter`
    Exponential {
        /// Delay after the first failure.
        base: Duration,
        /// Cap before jitter.
        max: Duration,
        /// Growth factor per attempt.
        multiplier: f32,
    },
    /// `attempt * step`, no jitter.
    Linear {
        /// Delay increment per failed attempt.
        step: Duration,
    },
}

/// How many attempts to make and how long to wait between them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Exponential {
                base: DEFAULT_BASE_DELAY,
                max: DEFAULT_MAX_DELAY,
                multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            },
        }
    }
}

impl RetryPolicy {
    /// Creates an exponential policy with custom settings.
    #[must_use]
    pub fn exponential(
        max_attempts: u32,
        base: Duration,
        max: Duration,
        multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential {
                base,
                max,
                multiplier,
            },
        }
    }

    /// Creates a linear policy: the n-th failure waits `n * step`.
    #[must_use]
    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Linear { step },
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the delay schedule.
    #[must_use]
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Decides whether to retry after `attempt` (1-indexed) failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        RetryDecision::Retry {
            delay: self.calculate_delay(attempt),
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Linear { step } => step.saturating_mul(attempt),
            Backoff::Exponential {
                base,
                max,
                multiplier,
            } => {
                let base_ms = base.as_millis() as f64;
                let exponent = f64::from(attempt.saturating_sub(1));
                let delay_ms = base_ms * f64::from(*multiplier).powf(exponent);
                let capped_ms = delay_ms.min(max.as_millis() as f64);
                Duration::from_millis(capped_ms as u64) + calculate_jitter()
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn calculate_jitter() -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_ms = rng.gen_range(0..=MAX_JITTER.as_millis() as u64);
    Duration::from_millis(jitter_ms)
}

/// Terminal failure of [`retry_with`].
#[derive(Debug)]
pub enum RetryError<E> {
    /// The classifier called the error permanent; no further attempts.
    Permanent {
        /// The error from the final attempt.
        error: E,
        /// Attempts made, including the failing one.
        attempts: u32,
    },
    /// Every allowed attempt failed with a retryable error.
    Exhausted {
        /// The error from the final attempt.
        last: E,
        /// Attempts made.
        attempts: u32,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Permanent { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// Consumes the wrapper, returning the final error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent { error, .. } => error,
            Self::Exhausted { last, .. } => last,
        }
    }
}

/// Runs `operation` until it succeeds, the classifier calls a failure
/// permanent, or the policy runs out of attempts.
///
/// `operation` receives the 1-indexed attempt number. `delay_hint` lets the
/// caller stretch the wait for a specific error (e.g. `Retry-After`); the
/// longer of the hint and the scheduled delay is used.
///
/// # Errors
///
/// Returns [`RetryError::Permanent`] or [`RetryError::Exhausted`].
pub async fn retry_with<T, E, Op, Fut, C>(
    policy: &RetryPolicy,
    classify: C,
    operation: Op,
) -> Result<T, RetryError<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> FailureType,
    E: std::fmt::Display,
{
    retry_with_hint(policy, classify, |_: &E| None, operation).await
}

/// [`retry_with`] plus a per-error delay hint.
///
/// # Errors
///
/// Returns [`RetryError::Permanent`] or [`RetryError::Exhausted`].
pub async fn retry_with_hint<T, E, Op, Fut, C, H>(
    policy: &RetryPolicy,
    classify: C,
    delay_hint: H,
    mut operation: Op,
) -> Result<T, RetryError<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> FailureType,
    H: Fn(&E) -> Option<Duration>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        debug!(attempt, "running attempt");

        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let failure_type = classify(&error);
        match policy.should_retry(failure_type, attempt) {
            RetryDecision::Retry {
                delay: scheduled,
                attempt: next_attempt,
            } => {
                let hinted = delay_hint(&error).map(|d| d.min(MAX_RETRY_AFTER));
                let delay = hinted.map_or(scheduled, |h| h.max(scheduled));
                info!(
                    attempt = next_attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(%reason, attempt, "not retrying");
                return Err(if failure_type == FailureType::Permanent {
                    RetryError::Permanent {
                        error,
                        attempts: attempt,
                    }
                } else {
                    RetryError::Exhausted {
                        last: error,
                        attempts: attempt,
                    }
                });
            }
        }
    }
}

/// Parses a `Retry-After` header value (delta-seconds or HTTP-date).
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }
    let when = httpdate::parse_http_date(trimmed).ok()?;
    let delay = when.duration_since(std::time::SystemTime::now()).ok()?;
    Some(delay.min(MAX_RETRY_AFTER))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(
            policy.backoff(),
            &Backoff::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(32),
                multiplier: 2.0,
            }
        );
    }

    #[test]
    fn test_retry_policy_max_attempts_minimum_is_one() {
        assert_eq!(RetryPolicy::linear(0, Duration::ZERO).max_attempts(), 1);
    }

    #[test]
    fn test_linear_delay_is_attempt_times_step() {
        let policy = RetryPolicy::linear(5, Duration::from_secs(10));
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(10));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(20));
        assert_eq!(policy.calculate_delay(4), Duration::from_secs(40));
    }

    #[test]
    fn test_exponential_delay_respects_cap() {
        let policy = RetryPolicy::exponential(
            10,
            Duration::from_secs(1),
            Duration::from_secs(5),
            2.0,
        );
        let delay = policy.calculate_delay(6);
        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_millis(5500));
    }

    #[test]
    fn test_should_retry_permanent_does_not_retry() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(FailureType::Permanent, 1);
        assert!(matches!(decision, RetryDecision::DoNotRetry { reason } if reason.contains("permanent")));
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = RetryPolicy::linear(3, Duration::from_millis(1));
        assert!(matches!(
            policy.should_retry(FailureType::RateLimited, 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::RateLimited, 3),
            RetryDecision::DoNotRetry { reason } if reason.contains("exhausted")
        ));
    }

    #[tokio::test]
    async fn test_retry_with_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::linear(5, Duration::from_millis(1));
        let counter = Arc::clone(&calls);
        let result: Result<&str, RetryError<String>> = retry_with(
            &policy,
            |_| FailureType::Transient,
            move |attempt| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err("flaky".to_string())
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_with_stops_on_permanent() {
        let policy = RetryPolicy::linear(5, Duration::from_millis(1));
        let result: Result<(), RetryError<String>> = retry_with(
            &policy,
            |_| FailureType::Permanent,
            |_| async { Err("gone".to_string()) },
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Permanent { attempts: 1, .. }));
        assert_eq!(err.into_inner(), "gone");
    }

    #[tokio::test]
    async fn test_retry_with_reports_exhaustion() {
        let policy = RetryPolicy::linear(4, Duration::from_millis(1));
        let result: Result<(), RetryError<String>> = retry_with(
            &policy,
            |_| FailureType::RateLimited,
            |attempt| async move { Err(format!("quota {attempt}")) },
        )
        .await;
        match result.unwrap_err() {
            RetryError::Exhausted { last, attempts } => {
                assert_eq!(attempts, 4);
                assert_eq!(last, "quota 4");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_hint_uses_longer_delay() {
        let policy = RetryPolicy::linear(2, Duration::from_secs(1));
        let started = tokio::time::Instant::now();
        let _: Result<(), RetryError<String>> = retry_with_hint(
            &policy,
            |_| FailureType::RateLimited,
            |_| Some(Duration::from_secs(7)),
            |_| async { Err("slow down".to_string()) },
        )
        .await;
        assert!(started.elapsed() >= Duration::from_secs(7));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("999999"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("soon"), None);
    }
}
