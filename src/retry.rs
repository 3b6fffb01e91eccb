//! Bounded exponential-backoff retry around a single fallible call.
//!
//! The controller knows nothing about batching or progress. It attempts
//! the operation, asks the error whether it is retryable, and either gives
//! up or sleeps `min(base * multiplier^(attempt-1), max)` before the next
//! attempt. `max_retries` counts retries, so at most `max_retries + 1`
//! attempts are made.

use std::future::Future;
use std::time::Duration;

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Wraps one operation with the retry policy.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    config: RetryConfig,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the retry budget is spent. Returns the last error on exhaustion.
    ///
    /// `max_retries` counts retries, so `operation` runs at most
    /// `max_retries + 1` times.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.config.max_retries => {
                    tracing::warn!(attempts = attempt + 1, error = %e, "retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.config.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransientKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryController {
        RetryController::new(RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        })
    }

    async fn flaky(calls: &AtomicU32, failures: u32) -> Result<&'static str, PipelineError> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < failures {
            Err(PipelineError::transient(TransientKind::Upstream(503), "busy"))
        } else {
            Ok("done")
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let c = RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
        };
        assert_eq!(c.delay_for(1), Duration::from_millis(100));
        assert_eq!(c.delay_for(2), Duration::from_millis(200));
        assert_eq!(c.delay_for(4), Duration::from_millis(800));
        assert_eq!(c.delay_for(5), Duration::from_millis(1000));
        assert_eq!(c.delay_for(60), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn succeeds_after_k_failures_with_k_plus_one_calls() {
        let calls = AtomicU32::new(0);
        let out = fast(3).execute(|| flaky(&calls, 2)).await;
        assert_eq!(out.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries_plus_one_attempts() {
        let calls = AtomicU32::new(0);
        let out = fast(3).execute(|| flaky(&calls, 10)).await;
        assert!(matches!(out, Err(PipelineError::Transient { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn last_retry_can_still_succeed() {
        // three failures, three retries: the fourth attempt is the last one allowed
        let calls = AtomicU32::new(0);
        let out = fast(3).execute(|| flaky(&calls, 3)).await;
        assert_eq!(out.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn zero_retries_means_one_attempt() {
        let calls = AtomicU32::new(0);
        let out = fast(0).execute(|| flaky(&calls, 1)).await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_errors_abort_immediately() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = fast(5)
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PipelineError::Rejected("nope".into())) }
            })
            .await;
        assert!(matches!(out, Err(PipelineError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
