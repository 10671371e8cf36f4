//! Retry with exponential backoff and jitter for provider calls. Only
//! transient failures (5xx, rate limit, timeout, connection reset) retry;
//! everything else surfaces immediately.

use std::time::Duration;

use engram_schema::{EngramError, Result};
use rand::Rng;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let backed_off = base_ms * self.backoff_multiplier.powi(attempt as i32);
        let capped = backed_off.min(self.max_delay.as_millis() as f64);
        let jitter = if self.jitter_factor > 0.0 {
            let spread = capped * self.jitter_factor;
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Whether an error is worth retrying. Providers tag transient failures as
/// `Unavailable`; deterministic failures pass through untouched.
pub fn is_transient(err: &EngramError) -> bool {
    matches!(
        err,
        EngramError::Unavailable(_) | EngramError::ResourceExhausted(_)
    )
}

pub async fn retry_with_backoff<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt + 1 < config.max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient provider error, retrying: {err}"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default().with_initial_delay(Duration::from_millis(1));
        let result = retry_with_backoff(&config, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngramError::unavailable("flaky"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default().with_initial_delay(Duration::from_millis(1));
        let err = retry_with_backoff::<u32, _, _>(&config, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngramError::unavailable("down")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "unavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deterministic_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default().with_initial_delay(Duration::from_millis(1));
        let err = retry_with_backoff::<u32, _, _>(&config, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngramError::invalid_argument("bad request")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 10.0,
            jitter_factor: 0.0,
        };
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(30));
    }
}
