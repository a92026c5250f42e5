use std::future::Future;
use std::time::Duration;

use crate::models::CoreErrorKind;
use crate::orchestration::OrchestrationResult;

/// Bounded exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before attempt `failed_attempts + 1`.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32) as i32;
        let factor = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier.powi(exponent)
        } else {
            1.0
        };
        let seconds = self.initial_backoff.as_secs_f64() * factor;
        if !seconds.is_finite() || seconds >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(seconds)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

/// Runs `operation` until it succeeds, fails with an error other than
/// `ConcurrencyConflict`, or the policy is exhausted.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> OrchestrationResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OrchestrationResult<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(error)
                if error.kind == CoreErrorKind::ConcurrencyConflict
                    && attempt < policy.attempts() =>
            {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    message = %error.message,
                    "retrying after concurrency conflict"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}
