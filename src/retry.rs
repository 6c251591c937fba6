//! Bounded retry with exponential backoff and cancellation.
//!
//! Every remote call made by the registration and deregistration protocols is
//! raced against a [`CancellationToken`] so an operator-level deadline can
//! abort a stuck invocation. The retry loop only repeats errors that report
//! themselves as retryable; anything else is returned on the first attempt.
//!
//! # Example
//!
//! ```ignore
//! use meshplane::retry::{retry_with_backoff, RetryConfig};
//!
//! let token = retry_with_backoff(
//!     &RetryConfig::token_poll(),
//!     "wait_for_token",
//!     &cancel,
//!     || async { fetch_token().await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Budget used while waiting for a service account token secret.
    ///
    /// 100ms doubling over 7 attempts: six sleeps totalling 6.3s.
    pub fn token_poll() -> Self {
        Self {
            max_attempts: 7,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Upper bound on total time spent sleeping between attempts.
    ///
    /// Returns `None` for infinite configs. Ignores jitter.
    pub fn total_sleep_budget(&self) -> Option<Duration> {
        if self.max_attempts == 0 {
            return None;
        }
        let mut delay = self.initial_delay;
        let mut total = Duration::ZERO;
        for _ in 1..self.max_attempts {
            total += delay;
            delay = self.next_delay(delay);
        }
        Some(total)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Run a future unless the token is cancelled first.
pub async fn cancellable<T, Fut>(
    cancel: &CancellationToken,
    operation_name: &str,
    fut: Fut,
) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(operation_name)),
        result = fut => result,
    }
}

/// Execute an async operation with exponential backoff.
///
/// Retries only while the returned error is [`Error::is_retryable`] and the
/// attempt budget is not exhausted. Both the operation and the sleeps are
/// interrupted by `cancel`.
///
/// # Returns
/// The result of the operation, or the last error once attempts run out.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let err = match cancellable(cancel, operation_name, operation()).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(err);
        }

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %err,
                "Operation failed after max retries"
            );
            return Err(err);
        }

        let sleep_for = if config.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(delay.as_secs_f64() * factor)
        } else {
            delay
        };

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = sleep_for.as_millis(),
            "Operation failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(operation_name)),
            _ = tokio::time::sleep(sleep_for) => {}
        }

        delay = config.next_delay(delay);
    }
}
