use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::{FulfillmentError, FulfillmentResult};

/// Bounded exponential backoff for benign races only, e.g. a sweep that
/// lost to a transition landing on the same donation. Claim losses are
/// never retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt + 1`, doubling each time and capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with anything but `Conflict`, or
    /// the attempts are used up. Each attempt must re-read its own state.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> FulfillmentResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = FulfillmentResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Err(e @ FulfillmentError::Conflict { .. }) if attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(attempt, ?delay, error = %e, "Benign conflict, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
