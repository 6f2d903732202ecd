use crate::error::{RagError, Result};
use log::warn;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Await `future` for at most `limit`, reporting expiry through `on_timeout`
pub async fn bounded<T, F>(limit: Duration, on_timeout: fn(String) -> RagError, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(format!(
            "timed out after {:.1}s",
            limit.as_secs_f64()
        ))),
    }
}

/// Retry policy for provider calls
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            retries,
            base_delay,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the retries are used up
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    let delay = self.delay(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {}ms",
                        what,
                        attempt + 1,
                        self.retries + 1,
                        e,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
