//! Retry policy: decides backoff delays and drives the attempt loop.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::domain::TaskError;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for a single delay.
    pub max_delay: Duration,

    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Scale each delay by a uniform factor in [0.5, 1.0].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts.max(1),
            jitter: config.jitter,
        }
    }

    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff after the `attempt`-th failure (1-indexed), before jitter:
    /// `min(base_delay * multiplier^(attempt - 1), max_delay)`.
    ///
    /// With base_delay=1s, multiplier=2.0, max_delay=5s:
    /// 1s, 2s, 4s, 5s, 5s, ...
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// `next_delay`, jittered if enabled.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.next_delay(attempt);
        if !self.jitter {
            return delay;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        delay.mul_f64(factor)
    }

    /// Whether another attempt may follow the `attempt`-th failure.
    pub fn can_retry(&self, error: &TaskError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    /// Run `f` until it succeeds, fails non-retryably, or attempts run out.
    ///
    /// `f` receives the 1-based attempt number. A cancelled `cancel` token
    /// aborts the pending backoff and no further attempt is started.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut f: F) -> EngineResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let mut attempt = 1;
        loop {
            let err = match f(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(EngineError::Task(err));
            }
            if !self.can_retry(&err, attempt) {
                return Err(EngineError::RetryExhausted {
                    attempts: attempt,
                    last_error: err,
                });
            }

            let delay = self.backoff(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "attempt failed, backing off");

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(EngineError::Task(TaskError::cancelled(format!(
                        "cancelled before attempt {}, last error: {}",
                        attempt + 1,
                        err
                    ))));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts,
            jitter: false,
        }
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(3, 4)]
    #[case(4, 5)]
    #[case(40, 5)]
    fn exponential_backoff_is_capped(#[case] attempt: u32, #[case] secs: u64) {
        assert_eq!(policy(3).next_delay(attempt), Duration::from_secs(secs));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy(3)
        };
        for _ in 0..100 {
            let d = policy.backoff(3);
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(4), "{d:?}");
        }
    }

    #[rstest]
    #[case(TaskError::transient("x"), 1, true)]
    #[case(TaskError::infrastructure("x"), 2, true)]
    #[case(TaskError::transient("x"), 3, false)]
    #[case(TaskError::validation("x"), 1, false)]
    #[case(TaskError::authentication("x"), 1, false)]
    #[case(TaskError::cancelled("x"), 1, false)]
    fn can_retry_respects_kind_and_budget(
        #[case] err: TaskError,
        #[case] attempt: u32,
        #[case] expected: bool,
    ) {
        assert_eq!(policy(3).can_retry(&err, attempt), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = policy(3)
            .execute(&CancellationToken::new(), |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(TaskError::transient("flaky"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_is_returned_as_is() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = policy(5)
            .execute(&CancellationToken::new(), |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TaskError::validation("bad payload"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.task_error().map(|e| e.kind()), Some(ErrorKind::Validation));
        assert!(matches!(err, EngineError::Task(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_carries_last_error_and_attempts() {
        let err = policy(3)
            .execute(&CancellationToken::new(), |attempt| async move {
                Err::<(), _>(TaskError::transient(format!("attempt {attempt}")))
            })
            .await
            .unwrap_err();

        match err {
            EngineError::RetryExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.message(), "attempt 3");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_further_attempts() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };

        let err = policy(5)
            .execute(&cancel, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TaskError::transient("down"))
                }
            })
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.task_error().map(|e| e.kind()), Some(ErrorKind::Cancelled));
    }
}
