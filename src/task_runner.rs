//! Retry with exponential backoff for operations that are safe to repeat.
//!
//! Only idempotent reads (price polling, quote lookups) go through here.
//! Trade execution is never retried automatically.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_retries + 1,
            initial_delay,
            max_delay: initial_delay * 8,
        }
    }
}

#[derive(Debug)]
struct BackoffState {
    failures: u32,
    current_delay: Duration,
}

impl BackoffState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            failures: 0,
            current_delay: initial_delay,
        }
    }

    /// Returns the delay to wait before the next attempt.
    fn record_failure(&mut self, max_delay: Duration) -> Duration {
        self.failures += 1;
        let delay = self.current_delay;
        self.current_delay = std::cmp::min(self.current_delay * 2, max_delay);
        delay
    }
}

/// Runs `op` until it succeeds, fails with an error `is_retryable` rejects,
/// or `policy.max_attempts` is used up. The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    task_name: &str,
    policy: &RetryPolicy,
    is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    R: Fn(&E) -> bool,
{
    let mut state = BackoffState::new(policy.initial_delay);

    loop {
        match op().await {
            Ok(value) => {
                if state.failures > 0 {
                    warn!(
                        "Task '{}' recovered after {} failures",
                        task_name, state.failures
                    );
                }
                return Ok(value);
            }
            Err(e) => {
                let attempt = state.failures + 1;
                if !is_retryable(&e) {
                    return Err(e);
                }
                if attempt >= policy.max_attempts {
                    error!(
                        "Task '{}' failed after {} attempts: {}",
                        task_name, attempt, e
                    );
                    return Err(e);
                }
                let delay = state.record_failure(policy.max_delay);
                warn!(
                    "Task '{}' failed (attempt {}/{}): {}, retrying in {:?}",
                    task_name, attempt, policy.max_attempts, e, delay
                );
                sleep(delay).await;
            }
        }
    }
}
