//! Error types for cadenza-player
//!
//! Defines service-specific error types using thiserror for clear error
//! propagation. Recoverable playback errors are handled inside the session
//! orchestrator and never surface through this type; what does surface here
//! is configuration, persistence, transport, and invalid-request failures.

use thiserror::Error;

/// Main error type for the cadenza-player service
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Request against a rendering node failed
    #[error("Node error: {0}")]
    Node(String),

    /// No rendering node is currently usable
    #[error("No rendering node available")]
    NoNodeAvailable,

    /// A track request could not be resolved to a playable handle
    #[error("Resolve error: {0}")]
    Resolve(String),

    /// Chat-platform call failed
    #[error("Platform error: {0}")]
    Platform(String),

    /// Recommendation collaborator failed
    #[error("Recommendation error: {0}")]
    Recommend(String),

    /// Operation rejected in the session's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Session has entered Closing and accepts no new work
    #[error("Session is closing")]
    SessionClosing,

    /// Session lookup failed
    #[error("Session not found: {0}")]
    SessionNotFound(u64),

    /// Serialization errors (snapshots, API bodies)
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid request from the control surface
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using the cadenza-player Error
pub type Result<T> = std::result::Result<T, Error>;

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidState(_) | Error::SessionClosing => StatusCode::CONFLICT,
            Error::NoNodeAvailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
