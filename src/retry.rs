//! Retry utilities with exponential backoff and jitter.
//!
//! Only failures that may succeed on a later attempt are retried. Absence
//! of a resource is never an error, so a lookup that keeps failing surfaces
//! its last error instead of being mistaken for "not found".
//!
//! # Example
//!
//! ```ignore
//! use unseal_bootstrap::retry::{retry_with_backoff, RetryConfig};
//!
//! let ring = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(3),
//!     "get_key_ring",
//!     || async { kms.get_key_ring(&name).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (must be at least 1)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// Single attempt, no retry
    pub fn once() -> Self {
        Self::with_max_attempts(1)
    }

    /// Delay to sleep after the given (1-based) failed attempt, before jitter
    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(
            (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Retry an operation returning the crate error, using [`Error::is_retryable`].
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    retry_if(config, operation_name, Error::is_retryable, operation).await
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries while `should_retry` returns true for the error, up to
/// `max_attempts`. Non-retryable errors are returned immediately.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if attempt >= max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let delay = config.base_delay(attempt);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;
            }
        }
    }
}
