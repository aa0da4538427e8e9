//! Bounded retry for transient backend failures.
//!
//! Only `BackendError::Transient` is retried. Rejections and not-found
//! errors return immediately, and every retry is logged.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use stratus_backend::BackendError;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// No waiting between attempts; for tests and in-process backends.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts.max(1) {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "operation failed after max retries"
                    );
                    return Err(e);
                }

                let jittered = if delay.is_zero() {
                    Duration::ZERO
                } else {
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
                };

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "transient failure, retrying"
                );

                tokio::time::sleep(jittered).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out = retry_transient(&RetryConfig::immediate(3), "op", || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BackendError::Transient("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bounded() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out: Result<(), _> = retry_transient(&RetryConfig::immediate(2), "op", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Transient("busy".into()))
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejection_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out: Result<(), _> = retry_transient(&RetryConfig::immediate(5), "op", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Rejected("no".into()))
        })
        .await;
        assert_eq!(out, Err(BackendError::Rejected("no".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
