//! Retry classification and exponential backoff
//!
//! Chunk tasks never loop on errors themselves: a retryable failure is
//! recorded on the File (`last_error`, `next_try`) and the file is resumed
//! after [`backoff_delay`]. Short-lived calls into a hoster plugin (link
//! checks) use [`with_retry`] instead.
//!
//! # Example
//!
//! ```no_run
//! use rangedl::retry::{IsRetryable, with_retry};
//! use rangedl::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! with_retry(&config, || async { Ok::<_, MyError>(()) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::downloader::HosterError;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, 5xx, connection resets) return `true`.
/// Permanent failures (4xx, missing links, disk errors) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

fn io_is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::UnexpectedEof
    )
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            Error::Io(e) => io_is_transient(e),
            Error::Transaction(_)
            | Error::StaleEntity(_)
            | Error::Schema(_)
            | Error::UnknownAttribute { .. }
            | Error::InvalidValue { .. }
            | Error::ReadOnly { .. } => false,
            Error::Download(_) => false,
            Error::Database(_) | Error::Sqlx(_) => false,
            Error::Config { .. } => false,
            Error::Serialization(_) => false,
            Error::FileCollision { .. } => false,
            Error::ShuttingDown => false,
            Error::Other(_) => false,
        }
    }
}

impl IsRetryable for HosterError {
    fn is_retryable(&self) -> bool {
        match self {
            HosterError::Connection(_)
            | HosterError::RangeRejected
            | HosterError::NoMoreConnections
            | HosterError::Retry { .. } => true,
            // request timeout and rate limiting are the only retryable 4xx
            HosterError::Status(code) => *code >= 500 || *code == 408 || *code == 429,
            HosterError::Io(e) => io_is_transient(e),
            HosterError::Fatal(_) => false,
        }
    }
}

/// Delay before retry number `attempt` (1-based)
///
/// `initial_delay × multiplier^(attempt-1)`, capped at `max_delay`; with
/// jitter enabled the result lies in `[delay, 2 × delay]` before the cap.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let base = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    let base = base.min(config.max_delay.as_secs_f64());
    let delay = Duration::from_secs_f64(base);
    let delay = if config.jitter { add_jitter(delay) } else { delay };
    delay.min(config.max_delay)
}

/// Execute an async operation with exponential backoff retry logic
///
/// Returns the successful result or the last error once the error is not
/// retryable or `config.max_attempts` retries are used up.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;
                let delay = backoff_delay(config, attempt);
                tracing::warn!(
                    error = %e,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Uniform jitter between 0% and 100% of the delay
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
