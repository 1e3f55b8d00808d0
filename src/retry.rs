// src/retry.rs

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded retry with a linearly growing pause: `step`, `2 * step`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub step: Duration,
}

impl RetryPolicy {
    pub fn linear(attempts: u32, step: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            step,
        }
    }

    /// Pause after the failed attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.step * (attempt + 1)
    }

    /// Runs `op` until it succeeds, the attempts are used up, or `cancel`
    /// fires. Returns the last error on failure; `None` means no attempt
    /// produced an error, which only happens when cancelled up front.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, Option<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut last_error = None;
        for attempt in 0..self.attempts {
            if cancel.is_cancelled() {
                break;
            }
            debug!(attempt = attempt + 1, "starting attempt");
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "attempt failed");
                    last_error = Some(e);
                }
            }
            if attempt + 1 == self.attempts {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.backoff(attempt)) => {},
                _ = cancel.cancelled() => break,
            }
        }
        Err(last_error)
    }
}
