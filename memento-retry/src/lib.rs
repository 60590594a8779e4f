//! Caller-side retry and backoff for memento persistence operations
//!
//! The persister itself never retries: a failed write puts it into a sticky
//! failed state until the next checkpoint. Callers that want to retry a
//! checkpoint or a compaction wrap the call in [`with_backoff`], and the error
//! type decides through [`Retryable`] whether another attempt makes sense.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' gave up after {attempts} attempt(s): {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: BoxError,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: BoxError,
    },
}

impl RetryError {
    /// Name of the operation that failed
    pub fn operation(&self) -> &'static str {
        match self {
            RetryError::MaxRetriesExceeded { operation, .. }
            | RetryError::Permanent { operation, .. } => operation,
        }
    }

    /// The error returned by the last attempt
    pub fn into_source(self) -> BoxError {
        match self {
            RetryError::MaxRetriesExceeded { source, .. } | RetryError::Permanent { source, .. } => {
                source
            }
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Trait for categorizing errors as transient or permanent
pub trait Retryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Execute an operation with the default exponential backoff
///
/// `f` receives the attempt number, starting at 1.
pub fn with_backoff<F, T, E>(op_name: &'static str, f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> Result<T, E>,
    E: Retryable + std::error::Error + Send + Sync + 'static,
{
    with_custom_backoff(op_name, default_backoff_policy(), f)
}

/// Execute an operation with a custom backoff policy
///
/// Permanent errors stop immediately. Transient errors are retried until the
/// policy runs out of time, then reported as
/// [`RetryError::MaxRetriesExceeded`] carrying the last error.
pub fn with_custom_backoff<F, T, E>(
    op_name: &'static str,
    mut policy: ExponentialBackoff,
    mut f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> Result<T, E>,
    E: Retryable + std::error::Error + Send + Sync + 'static,
{
    policy.reset();
    let mut attempt = 1;

    loop {
        debug!("Attempting operation '{}' (attempt {})", op_name, attempt);

        match f(attempt) {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        "Operation '{}' succeeded after {} attempts",
                        op_name, attempt
                    );
                }
                return Ok(result);
            }
            Err(err) if err.is_permanent() => {
                warn!(
                    "Operation '{}' failed permanently on attempt {}: {}",
                    op_name, attempt, err
                );
                return Err(RetryError::Permanent {
                    operation: op_name,
                    source: Box::new(err),
                });
            }
            Err(err) => match policy.next_backoff() {
                Some(delay) => {
                    warn!(
                        "Operation '{}' failed on attempt {}, retrying in {:?}: {}",
                        op_name, attempt, delay, err
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                None => {
                    warn!(
                        "Operation '{}' failed on attempt {}, giving up: {}",
                        op_name, attempt, err
                    );
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
            },
        }
    }
}

/// Default backoff policy for general operations
pub fn default_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(Duration::from_secs(30)))
        .with_multiplier(2.0)
        .build()
}

/// Backoff policy for local directory operations (shorter timeouts)
pub fn local_storage_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_interval(Duration::from_secs(1))
        .with_max_elapsed_time(Some(Duration::from_secs(10)))
        .with_multiplier(2.0)
        .build()
}
