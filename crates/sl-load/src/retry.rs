//! Bounded exponential backoff for transient staging failures

use crate::error::{LoadError, LoadResult};
use crate::orchestrator::CancelToken;
use sl_core::config::RetrySettings;
use std::future::Future;
use std::time::Duration;

/// How many times to try an operation and how long to wait between tries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        let base_delay = Duration::from_millis(settings.base_delay_ms);
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_millis(settings.max_delay_ms).max(base_delay),
        }
    }

    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Wait before the retry that follows failed attempt `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// runs out of attempts. `op` receives the 1-based attempt number.
    ///
    /// Cancellation is honored before each attempt and while waiting
    /// between attempts, failing with `LoadError::Cancelled`.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancelToken,
        mut op: F,
    ) -> LoadResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = LoadResult<T>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "{label}: attempt {attempt}/{} failed: {e}; retrying in {}ms",
                        self.max_attempts,
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            log::warn!("{label}: cancelled while waiting to retry");
                            return Err(LoadError::Cancelled);
                        }
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[path = "retry_test.rs"]
mod tests;
