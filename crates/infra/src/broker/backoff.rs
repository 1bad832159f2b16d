//! Exponential backoff for reconnects and publish retries.

use std::future::Future;
use std::time::Duration;

use docflow_core::RetryPolicy;
use tracing::warn;

/// Stateful delay sequence over a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next try. Keeps growing up to the policy's cap.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.policy.delay_for_attempt(self.attempt)
    }

    /// Back to the base delay, after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping between failures.
///
/// Returns the last error once the budget is spent.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if policy.is_exhausted(attempt) => return Err(e),
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
