//! Error types for the reminder engine.

use std::time::Duration;

use thiserror::Error;

/// A task could not be created because its input was invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Description is empty or whitespace.
    #[error("description must not be empty")]
    EmptyDescription,

    /// Owner id is zero or negative.
    #[error("owner id must be a positive integer, got {0}")]
    InvalidOwner(i64),

    /// Deadline text could not be turned into a point in time.
    #[error("invalid deadline: {0}")]
    InvalidDeadline(String),
}

/// Errors raised by a task store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be serialized or parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Rejected input.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Errors raised by a notification transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Network or API hiccup, worth retrying.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// The transport asked to slow down, possibly saying for how long.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The transport refused the message and retrying now will not help.
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl SendError {
    /// Whether another attempt in the same tick makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Transient(_) | SendError::RateLimited { .. })
    }

    /// Minimum wait the transport asked for before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SendError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors that abort a scheduler operation.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Task store error.
    #[error("task store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid engine configuration.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
}
