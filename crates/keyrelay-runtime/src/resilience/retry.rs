//! Capped exponential backoff for retryable provider errors.

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::config::duration_str;
use crate::providers::LlmError;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, first call included
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_str")]
    pub min_delay: Duration,

    /// Upper bound for any single wait, `Retry-After` included
    #[serde(with = "duration_str")]
    pub max_delay: Duration,

    /// Randomize delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delays between attempts; yields `max_attempts - 1` values.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> + Send {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize);
        if self.jitter {
            builder = builder.with_jitter();
        }
        builder.build()
    }

    /// Wait before the next attempt: the larger of the backoff step and the
    /// provider's hint, never above `max_delay`.
    pub fn wait_for(&self, backoff: Duration, retry_after: Option<Duration>) -> Duration {
        backoff.max(retry_after.unwrap_or_default()).min(self.max_delay)
    }
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts. `call` receives the 1-based attempt number.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, provider: &str, mut call: F) -> Result<T, LlmError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut delays = policy.backoff();
    let mut attempt = 1;

    loop {
        match call(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                let Some(step) = delays.next() else {
                    tracing::warn!(provider, attempt, kind = %e.kind, "Retries exhausted");
                    return Err(e);
                };
                let delay = policy.wait_for(step, e.retry_after);
                tracing::warn!(
                    provider,
                    attempt,
                    delay = ?delay,
                    kind = %e.kind,
                    error = %e.message,
                    "Retrying provider call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
