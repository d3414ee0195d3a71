//! Error types for isis

use thiserror::Error;

/// Result type alias for isis operations
pub type Result<T> = std::result::Result<T, IsisError>;

/// Main error type for isis
///
/// Only failures that should stop a run are represented here. Malformed
/// lines, unreadable files and rejected bulk items are absorbed into run
/// counters by the ingestion pipeline and never surface as an `IsisError`.
#[derive(Error, Debug)]
pub enum IsisError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid file pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    /// The backend could not be reached, even after retrying
    #[error("Network error: {0}")]
    Network(String),

    /// The backend answered but refused the request
    #[error("Backend error (HTTP {status}): {message}")]
    Backend { status: u16, message: String },

    #[error("Progress store error: {0}")]
    Progress(String),
}

impl IsisError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn progress(msg: impl Into<String>) -> Self {
        Self::Progress(msg.into())
    }

    /// Whether the error means the backend itself is unavailable
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}
