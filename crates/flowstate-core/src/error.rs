//! Error types shared by the flowstate crates

use thiserror::Error;

/// Errors raised while validating caller input or loading settings
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Malformed payload identifier: {0}")]
    MalformedIdentifier(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a malformed identifier error
    pub fn malformed_identifier(msg: impl Into<String>) -> Self {
        Error::MalformedIdentifier(msg.into())
    }

    /// Whether this error was caused by bad caller input
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::MalformedIdentifier(_))
    }
}
