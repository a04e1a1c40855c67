//! Bounded fixed-delay retry for pipeline tasks

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default delay between attempts (5 minutes)
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 300;

/// How often and how patiently a task is re-attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
        }
    }
}

/// Final result of a retried operation plus the attempts it took
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            debug!(task = label, attempt, max_attempts, "Attempt started");
            match operation().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                },
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        task = label,
                        attempt,
                        max_attempts,
                        delay_secs = self.delay.as_secs(),
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                },
                Err(e) => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    }
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use dwh_common::DatasetName;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let calls = AtomicU32::new(0);
        let outcome = RetryPolicy::default()
            .run("load", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(PipelineError::load("orders", "connection reset"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(outcome.result.unwrap(), 7);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = RetryPolicy::default()
            .run("load", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::load("orders", "down"))
            })
            .await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_semantic_failures_fail_fast() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = RetryPolicy::default()
            .run("transform", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::MissingDataset(DatasetName::Orders))
            })
            .await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
    }
}
