//! Retry policy for indexer calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ChainError;

/// Exponential back-off: 500 ms initial, doubled per attempt, capped at 15 s,
/// five attempts total. Only transient errors are retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Per-call operation timeout.
    pub operation_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2,
            max_delay: Duration::from_secs(15),
            max_attempts: 5,
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        (self.initial_delay * factor).min(self.max_delay)
    }
}

/// Run `operation` under the policy, retrying transient failures.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let mut last_error = None;
    for attempt in 0..policy.max_attempts {
        let outcome = tokio::time::timeout(policy.operation_timeout, operation()).await;
        let error = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => error,
            Err(_) => ChainError::transient(
                operation_name,
                format!("operation timed out after {:?}", policy.operation_timeout),
            ),
        };
        if !error.is_transient() {
            return Err(error);
        }
        let delay = policy.delay_for_attempt(attempt);
        warn!(
            "{} failed (attempt {}/{}): {} - retrying in {:?}",
            operation_name,
            attempt + 1,
            policy.max_attempts,
            error,
            delay
        );
        last_error = Some(error);
        if attempt + 1 < policy.max_attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Err(last_error
        .unwrap_or_else(|| ChainError::transient(operation_name, "retries exhausted")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            multiplier: 2,
            max_delay: Duration::from_millis(4),
            max_attempts: 3,
            operation_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ChainError::transient("op", "flaky"))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ChainError::NotFound("tx".into())) }
        })
        .await;
        assert!(matches!(result, Err(ChainError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ChainError::transient("op", "down")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(15));
    }
}
