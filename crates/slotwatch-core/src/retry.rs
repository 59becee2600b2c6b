//! Bounded exponential backoff for copy and launch attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SlotwatchError};

/// Retry policy for retryable supervisor steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay_ms: u64,
    /// Growth factor per further failure.
    pub multiplier: f64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-indexed):
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay_ms`.
    ///
    /// With the defaults: 100ms, 200ms, 400ms, ... 5s, 5s.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let ms = (self.base_delay_ms as f64) * self.multiplier.powi(exp);
        let capped = ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is reached. Each failure is logged.
    pub async fn run<T, F>(&self, what: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= max => {
                    return Err(SlotwatchError::RetriesExhausted {
                        what,
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.next_delay(attempt);
                    warn!(
                        attempt,
                        max,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{what} failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
