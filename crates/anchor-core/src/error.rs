//! Error types for Anchor core library.

use thiserror::Error;

/// Result type alias using Anchor Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Anchor operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown lookup dimension
    #[error("Unknown lookup type: {0}")]
    UnknownLookupType(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
