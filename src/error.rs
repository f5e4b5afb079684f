//! Error types for the Rategate service.

use thiserror::Error;

/// Main error type for Rategate operations.
#[derive(Error, Debug)]
pub enum RateGateError {
    /// Configuration-related errors. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RateGateError {
    fn from(e: config::ConfigError) -> Self {
        RateGateError::Config(e.to_string())
    }
}

/// Result type alias for Rategate operations.
pub type Result<T> = std::result::Result<T, RateGateError>;
