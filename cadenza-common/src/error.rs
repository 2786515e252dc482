//! Shared error type for cadenza crates

use thiserror::Error;

/// Errors raised by shared components
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Invalid value for a field
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Convenience Result type using the shared Error
pub type Result<T> = std::result::Result<T, Error>;
