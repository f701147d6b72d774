//! Error taxonomy for extraction runs
//!
//! Only [`ExtractError::Setup`] and [`ExtractError::LedgerStorage`] escape
//! [`crate::driver::ExtractionDriver::run`]. Fetch and write failures are
//! scoped to one batch and end up in the run summary instead.

use thiserror::Error;

/// Result type alias for extraction operations
pub type Result<T> = std::result::Result<T, ExtractError>;

/// Errors crossing the driver boundary, plus the batch-level kinds it records
#[derive(Error, Debug)]
pub enum ExtractError {
    /// Credentials missing, source unreachable, invalid configuration
    #[error("Setup error: {0}")]
    Setup(String),

    /// A batch fetch failed after bounded retries
    #[error("Source fetch failed: {0}")]
    SourceFetch(#[from] SourceError),

    /// A partition write failed
    #[error("Partition write failed: {0}")]
    Write(#[from] WriteError),

    /// The ledger could not be persisted
    #[error("Ledger storage error: {0}")]
    LedgerStorage(#[from] LedgerError),
}

impl ExtractError {
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }
}

/// Errors raised by a source adapter
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("API error: {0}")]
    Api(String),

    #[error("Unexpected response shape: {0}")]
    Decode(String),

    #[error("Authentication failed: {0}")]
    Auth(String),
}

impl SourceError {
    /// Whether a later attempt of the same request could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SourceError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Errors raised by the partitioned writer
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("IO error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to persist {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: tempfile::PersistError,
    },
}

/// Errors raised while saving the coverage ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("IO error on ledger {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize ledger: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to persist ledger {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: tempfile::PersistError,
    },
}
