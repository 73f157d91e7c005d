//! Error types for connlimit.

use thiserror::Error;

/// Main error type for connlimit operations.
#[derive(Error, Debug)]
pub enum ConnLimitError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limit of zero was supplied
    #[error("Invalid limit {0}: limits must be positive")]
    InvalidLimit(u64),

    /// Outbound data that cannot be coerced to text
    #[error("Invalid payload: data must be string, scalar, or null, got: {0}")]
    InvalidPayload(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for ConnLimitError {
    fn from(err: config::ConfigError) -> Self {
        ConnLimitError::Config(err.to_string())
    }
}

/// Result type alias for connlimit operations.
pub type Result<T> = std::result::Result<T, ConnLimitError>;
