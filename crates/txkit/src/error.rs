//! Error types for lock acquisition and release.

use crate::lock::Permit;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while acquiring or releasing the lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// Release attempted by a permit that does not hold the lock
    #[error("permit {permit} does not hold the lock")]
    NotHolder {
        /// The permit that attempted the release
        permit: Permit,
    },

    /// The lock could not be acquired in time
    #[error("timed out after {}s waiting for the controller lock", timeout.as_secs_f64())]
    Timeout {
        /// How long the caller waited
        timeout: Duration,
    },

    /// The waiting operation was cancelled
    #[error("cancelled while waiting for the controller lock")]
    Cancelled,
}

impl LockError {
    /// Whether waiting again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;
