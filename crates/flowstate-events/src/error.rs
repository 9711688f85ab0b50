//! Error types for the workflow event write path

use flowstate_store::StoreError;
use thiserror::Error;

/// Why a failed task's error log could not be located
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogExtractionError {
    #[error("Unable to get error log: Cause is not defined")]
    MissingCause,

    #[error("Unable to get error log: Cause is not valid JSON ({0})")]
    MalformedCause(String),

    #[error("Unable to get error log: Attempts is empty")]
    EmptyAttempts,

    #[error("Unable to get error log: Container for last Attempt is missing")]
    MissingContainer,

    #[error("Unable to get error log: LogStreamName for last Attempt is missing")]
    MissingLogStreamName,
}

/// Main error type for announcing workflow events
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Status does not support updates: {0}")]
    UnsupportedStatus(String),

    #[error(transparent)]
    LogExtraction(#[from] LogExtractionError),

    #[error(transparent)]
    Core(#[from] flowstate_core::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, EventError>;

impl EventError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        EventError::Validation(msg.into())
    }

    /// Create a publish error
    pub fn publish(msg: impl Into<String>) -> Self {
        EventError::Publish(msg.into())
    }

    /// Malformed input that will never succeed on retry
    pub fn is_validation(&self) -> bool {
        match self {
            EventError::Validation(_) | EventError::UnsupportedStatus(_) => true,
            EventError::Store(e) => e.is_validation(),
            EventError::Core(e) => e.is_validation(),
            _ => false,
        }
    }

    /// Lost a claim race; callers treat this as a no-op
    pub fn is_already_claimed(&self) -> bool {
        matches!(self, EventError::Store(e) if e.is_already_claimed())
    }
}
