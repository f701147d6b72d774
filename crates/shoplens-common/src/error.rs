//! Error types shared across Shoplens crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared types
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid extraction unit '{0}': expected YYYY-MM-DD or YYYYMM")]
    InvalidUnit(String),

    #[error("Granularity mismatch: expected {expected}, got {actual}")]
    GranularityMismatch { expected: String, actual: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
