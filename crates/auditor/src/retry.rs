//! Bounded exponential-backoff retry shared by the store and chain adapters.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry schedule: up to `max_attempts` tries, doubling the delay each time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    /// True for transient failures (connectivity, busy, timeouts).
    fn is_retryable(&self) -> bool;
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy is exhausted.
///
/// The last error is returned unchanged; callers decide how to classify an
/// exhausted retryable error.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "{} failed, retrying: {}",
                    what,
                    e
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        transient: bool,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (transient: {})", self.transient)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.transient
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, TestError> = retry(&fast(5), "flaky op", move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(TestError { transient: true })
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), TestError> = retry(&fast(4), "down op", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TestError { transient: true })
        })
        .await;

        assert!(result.unwrap_err().transient);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), TestError> = retry(&fast(4), "bad op", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TestError { transient: false })
        })
        .await;

        assert!(!result.unwrap_err().transient);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let _: Result<(), TestError> = retry(&fast(0), "op", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TestError { transient: true })
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
