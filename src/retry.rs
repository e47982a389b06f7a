use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rand::Rng as _;
use tokio::time::{sleep, timeout};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub timeout: Duration,
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter_ms: 250,
        }
    }
}

impl RetryConfig {
    /// Exponential delay for the given zero-based attempt, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let capped = std::cmp::min(backoff, self.max_delay);
        let jitter = if self.jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms))
        };
        capped + jitter
    }
}

/// Runs a single call under `timeout`, no retries. For calls that are not safe to repeat.
pub async fn with_timeout<T, Fut>(label: &str, limit: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => anyhow::bail!("{label} timed out after {limit:?}"),
    }
}

/// Retries an idempotent call with timeout and exponential backoff.
pub async fn retry_with_timeout<T, F, Fut>(label: &str, config: &RetryConfig, mut action: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_retries.saturating_add(1);
    for attempt in 0..attempts {
        match timeout(config.timeout, action()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                if attempt + 1 >= attempts {
                    return Err(err);
                }
                warn!(attempt = attempt + 1, error = %format!("{err:#}"), "{label} failed; retrying");
            }
            Err(_) => {
                if attempt + 1 >= attempts {
                    anyhow::bail!("{label} timed out after {} attempts", attempts);
                }
                warn!(attempt = attempt + 1, "{label} timed out; retrying");
            }
        }

        sleep(config.backoff(attempt as u32)).await;
    }

    anyhow::bail!("{label} retries exhausted")
}
