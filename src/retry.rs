//! Retry and error recovery utilities for on-chain submission
//!
//! Provides exponential backoff and error classification. Only transient
//! failures are retried; validation, economic, and permanent failures
//! surface to the caller immediately.

use eyre::{eyre, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Submission retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure, retry (RPC timeout, network issues)
    Transient,
    /// The record itself is malformed or fails a precheck; never retry
    Validation,
    /// Bond/liquidity shortfall; leave the record where it is, do not
    /// burn retry attempts on it
    Economic,
    /// Permanent failure, do not retry (revert, bad signature)
    Permanent,
    /// Unknown error, retry with backoff
    Unknown,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Unknown)
    }
}

/// Classify an error message for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("integrity")
        || error_lower.contains("expired")
        || error_lower.contains("no token mapping")
        || error_lower.contains("malformed")
        || error_lower.contains("unknown key version")
    {
        return ErrorClass::Validation;
    }

    if error_lower.contains("insufficient bond")
        || error_lower.contains("insufficient liquidity")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("already claimed")
    {
        return ErrorClass::Economic;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("execution reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("out of gas")
        || error_lower.contains("nonce too low")
        || error_lower.contains("already known")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Execute with retry logic, backing off between transient failures
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let error_str = e.to_string();
                let class = classify_error(&error_str);
                attempt += 1;

                if !class.is_retryable() {
                    debug!(error = %error_str, ?class, "Non-retryable error");
                    return Err(eyre!("{:?}: {}", class, error_str));
                }
                if !config.should_retry(attempt) {
                    warn!(error = %error_str, attempt, "Retries exhausted");
                    return Err(eyre!("retries exhausted: {}", error_str));
                }

                let backoff = config.backoff_for_attempt(attempt - 1);
                warn!(
                    attempt,
                    max = config.max_retries,
                    ?backoff,
                    error = %error_str,
                    "Retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(16));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(32));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(60)); // capped
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection timeout"), ErrorClass::Transient);
        assert_eq!(
            classify_error("envelope integrity check failed"),
            ErrorClass::Validation
        );
        assert_eq!(
            classify_error("insufficient bond: 5 < 100"),
            ErrorClass::Economic
        );
        assert_eq!(classify_error("execution reverted"), ErrorClass::Permanent);
        assert_eq!(classify_error("some unknown error"), ErrorClass::Unknown);
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient() {
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        };
        let calls = AtomicU32::new(0);

        let result: Result<u32> = with_retry(&config, |_attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(eyre!("connection timeout"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_permanent() {
        let config = RetryConfig::default();
        let calls = AtomicU32::new(0);

        let result: Result<u32> = with_retry(&config, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(eyre!("execution reverted")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
