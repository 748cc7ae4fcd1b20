//! Rate-limit retry executor
//!
//! Wraps a single client call and retries it only when the server rejects
//! it for exceeding the request quota, waiting either the server's
//! `Retry-After` hint or a configured default between attempts.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::delay::sleep_or_cancel;
use crate::error::{ClientError, RetryableError};

/// Execute `operation`, retrying rate-limited attempts
///
/// At most `max_retries + 1` attempts are made. Exhaustion returns the last
/// rate-limit error; any other failure returns immediately. Cancellation
/// during a backoff wait returns [`ClientError::Cancelled`].
pub async fn execute_with_retry<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    default_retry_delay: Duration,
    cancel: &CancellationToken,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                if attempt >= max_retries {
                    warn!(
                        attempts = attempt + 1,
                        max_retries = max_retries,
                        error = %err,
                        "Rate limit retries exhausted"
                    );
                    return Err(err);
                }

                let backoff = err.retry_after().unwrap_or(default_retry_delay);
                debug!(
                    attempt = attempt + 1,
                    max_retries = max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    "Rate limited, backing off before retry"
                );

                sleep_or_cancel(backoff, cancel).await?;
                attempt += 1;
            }
        }
    }
}

/// Retry executor bound to a [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    max_retries: u32,
    default_retry_delay: Duration,
}

impl RetryExecutor {
    /// Create an executor with explicit limits
    pub fn new(max_retries: u32, default_retry_delay: Duration) -> Self {
        Self {
            max_retries,
            default_retry_delay,
        }
    }

    /// Execute an operation with this executor's limits
    pub async fn execute<F, Fut, T>(
        &self,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        execute_with_retry(operation, self.max_retries, self.default_retry_delay, cancel).await
    }

    /// Maximum retries after the initial attempt
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Wait used when the server gives no hint
    pub fn default_retry_delay(&self) -> Duration {
        self.default_retry_delay
    }
}

impl From<&RetryConfig> for RetryExecutor {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, config.default_retry_delay())
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}
