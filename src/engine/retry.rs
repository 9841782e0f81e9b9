// Retry policy with exponential backoff and jitter

//! # Retrying Invoker
//!
//! [`retry_with_policy`] drives an outbound operation until it succeeds, hits
//! a non-retryable error, exhausts `max_attempts`, or is told to stop by the
//! caller's `keep_going` check (used for breaker and cancellation checks
//! between attempts).
//!
//! Delays grow with the configured [`BackoffStrategy`]; jitter only ever
//! *adds* up to `jitter × raw_delay`, so with the exponential default the
//! jittered windows `[2s,3s) [4s,6s) [8s,12s) …` never overlap and the
//! observed delays are strictly increasing until `max_delay` caps them.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Classified failure of a single outbound attempt
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error("network error: {0}")]
    Network(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("cancelled")]
    Cancelled,
}

impl CallError {
    /// Network errors, timeouts, 5xx and 429 are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::Network(_)
                | CallError::Timeout(_)
                | CallError::Server { .. }
                | CallError::RateLimited { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CallError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify an HTTP status returned by an endpoint
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        match status {
            429 => CallError::RateLimited { retry_after },
            500..=599 => CallError::Server {
                status,
                message: message.into(),
            },
            _ => CallError::Client {
                status,
                message: message.into(),
            },
        }
    }
}

/// How the raw delay grows between attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential { multiplier: f64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential { multiplier: 2.0 }
    }
}

/// Retry budget and delay shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the raw delay added as random jitter, in `[0, 1)`
    pub jitter: f64,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: 0.5,
            strategy: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Same delays, but only one attempt (HALF_OPEN trial calls)
    pub fn single_attempt(&self) -> Self {
        Self {
            max_attempts: 1,
            ..self.clone()
        }
    }

    /// Delay before retry number `retry` (0 = after the first failure), no jitter
    pub fn raw_delay(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let secs = match &self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * f64::from(retry + 1),
            BackoffStrategy::Exponential { multiplier } => base * multiplier.powi(retry as i32),
        };
        // Negative or non-finite factors fall back to the cap instead of panicking
        Duration::try_from_secs_f64(secs.min(self.max_delay.as_secs_f64())).unwrap_or(self.max_delay)
    }

    /// Inclusive lower and exclusive upper bound of the jittered delay
    pub fn delay_bounds(&self, retry: u32) -> (Duration, Duration) {
        let raw = self.raw_delay(retry);
        let upper = raw.mul_f64(1.0 + self.jitter.clamp(0.0, 1.0)).min(self.max_delay);
        (raw, upper)
    }

    /// Jittered delay, honoring a server-provided retry-after hint
    pub fn delay_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let (lower, upper) = self.delay_bounds(retry);
        let jittered = if upper > lower {
            rand::thread_rng().gen_range(lower..upper)
        } else {
            lower
        };
        match retry_after {
            Some(hint) => jittered.max(hint).min(self.max_delay),
            None => jittered,
        }
    }
}

/// Everything the retry loop observed
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, CallError>,
    pub attempts: u32,
    /// Sleeps taken between attempts, in order
    pub delays: Vec<Duration>,
}

/// Run `operation` under `policy`
///
/// `operation` receives the 1-based attempt number. `keep_going` is consulted
/// before every retry; returning `false` stops the loop with the last error.
pub async fn retry_with_policy<T, F, Fut, K>(
    policy: &RetryPolicy,
    keep_going: K,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
    K: Fn() -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delays = Vec::new();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    delays,
                }
            }
            Err(error) => error,
        };

        if !error.is_retryable() || attempt >= max_attempts || !keep_going() {
            return RetryOutcome {
                result: Err(error),
                attempts: attempt,
                delays,
            };
        }

        let delay = policy.delay_for(attempt - 1, error.retry_after());
        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying after transient failure");
        delays.push(delay);
        tokio::time::sleep(delay).await;

        if !keep_going() {
            return RetryOutcome {
                result: Err(error),
                attempts: attempt,
                delays,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_three_transient_failures_then_success() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = retry_with_policy(&policy, || true, |_| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(CallError::Server {
                        status: 503,
                        message: "unavailable".into(),
                    })
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(outcome.result, Ok("done"));
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.delays.len(), 3);
        for (retry, delay) in outcome.delays.iter().enumerate() {
            let (lower, upper) = policy.delay_bounds(retry as u32);
            assert!(*delay >= lower && *delay < upper, "delay {:?} outside bounds", delay);
        }
        assert!(outcome.delays.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_fails_without_retry() {
        let policy = RetryPolicy::default();
        let outcome: RetryOutcome<()> = retry_with_policy(&policy, || true, |_| async {
            Err(CallError::Client {
                status: 422,
                message: "bad scope".into(),
            })
        })
        .await;

        assert_eq!(outcome.attempts, 1);
        assert!(outcome.delays.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_returns_last_error() {
        let policy = RetryPolicy::default();
        let outcome: RetryOutcome<()> = retry_with_policy(&policy, || true, |attempt| async move {
            Err(CallError::Network(format!("reset on attempt {}", attempt)))
        })
        .await;

        assert_eq!(outcome.attempts, 4);
        assert_eq!(
            outcome.result,
            Err(CallError::Network("reset on attempt 4".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_going_stops_loop() {
        let policy = RetryPolicy::default();
        let outcome: RetryOutcome<()> =
            retry_with_policy(&policy, || false, |_| async { Err(CallError::Timeout(Duration::from_secs(1))) }).await;
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn test_retry_after_hint_is_honored_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0, Some(Duration::from_secs(20))), Duration::from_secs(20));
        assert_eq!(policy.delay_for(0, Some(Duration::from_secs(90))), Duration::from_secs(30));
    }

    #[test]
    fn test_delays_are_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.raw_delay(10), Duration::from_secs(30));
        let (lower, upper) = policy.delay_bounds(10);
        assert_eq!(lower, upper);
    }

    #[test]
    fn test_degenerate_multiplier_never_panics() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Exponential { multiplier: -2.0 },
            ..RetryPolicy::default()
        };
        assert_eq!(policy.raw_delay(1), Duration::from_secs(30));

        let policy = RetryPolicy {
            strategy: BackoffStrategy::Exponential { multiplier: f64::NAN },
            ..RetryPolicy::default()
        };
        assert!(policy.raw_delay(2) <= Duration::from_secs(30));
    }

    #[test]
    fn test_status_classification() {
        assert!(CallError::from_status(503, "down", None).is_retryable());
        assert!(CallError::from_status(429, "slow down", Some(Duration::from_secs(3))).is_retryable());
        assert!(!CallError::from_status(404, "missing", None).is_retryable());
    }
}
