//! Fixed-backoff retry for gateway requests.
//!
//! Rate-limit responses and connection failures are retried after a fixed
//! delay, up to a bounded number of extra attempts. Callers above the gateway
//! only see the final result.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{PosguardError, Result};

/// Retry settings
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retries (excluding the first attempt)
    pub max_retries: u32,
    /// Delay between attempts
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Run `operation`, retrying while `should_retry` accepts the error.
pub async fn with_retry_if<T, F, Fut, P>(
    config: &RetryConfig,
    operation: F,
    should_retry: P,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&PosguardError) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "Request succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }

                if attempt >= config.max_retries {
                    warn!(
                        error = %e,
                        attempts = attempt + 1,
                        "Retries exhausted"
                    );
                    return Err(e);
                }

                warn!(
                    error = %e,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = config.backoff.as_millis() as u64,
                    "Retrying request"
                );
                tokio::time::sleep(config.backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Retry every transient error.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_if(config, operation, PosguardError::is_transient).await
}
