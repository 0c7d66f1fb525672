use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use opsgate_common::RetryConfig;
use rand::Rng;
use tracing::*;

/// Retries a fallible async operation with geometric backoff and jitter.
/// Errors whose rendered message contains a configured non-retryable
/// substring abort immediately.
#[derive(Clone)]
pub struct ExponentialRetryer {
    config: RetryConfig,
}

impl ExponentialRetryer {
    pub fn new(config: RetryConfig) -> Self {
        ExponentialRetryer { config }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .initial_delay
            .as_secs_f64()
            * self.config.ratio.powi(attempt as i32);
        let base = base.min(self.config.max_delay.as_secs_f64());
        let jitter = if self.config.jitter_ratio > 0.0 && base > 0.0 {
            rand::thread_rng().gen_range(0.0..base * self.config.jitter_ratio)
        } else {
            0.0
        };
        Duration::from_secs_f64(base + jitter)
    }

    fn is_retryable(&self, message: &str) -> bool {
        !self
            .config
            .non_retryable
            .iter()
            .any(|needle| message.contains(needle))
    }

    pub async fn call<T, E, F, Fut>(&self, mut f: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let message = error.to_string();
                    if !self.is_retryable(&message) {
                        debug!(%message, "Error is not retryable");
                        return Err(error);
                    }
                    attempt += 1;
                    if attempt >= self.config.max_attempts {
                        return Err(error);
                    }
                    let delay = self.delay(attempt - 1);
                    debug!(%message, attempt, ?delay, "Retrying after failure");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
