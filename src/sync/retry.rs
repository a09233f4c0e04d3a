/// Bounded exponential backoff for provider calls
use crate::error::{CalError, CalResult, ProviderError};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy for one provider call
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
        }
    }

    /// Delay before attempt `attempt + 1`; a provider `Retry-After` wins when larger.
    pub fn delay(&self, attempt: u32, err: &CalError) -> Duration {
        let exponential = self.base * 2_u32.saturating_pow(attempt.saturating_sub(1));
        match err {
            CalError::Provider(ProviderError::RateLimited {
                retry_after: Some(retry_after),
            }) => exponential.max(*retry_after),
            _ => exponential,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only transient failures are retried. Reauthorization failures and
    /// everything else come back after the first attempt.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> CalResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CalResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt, &err);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{} failed, retrying: {}",
                        label,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
