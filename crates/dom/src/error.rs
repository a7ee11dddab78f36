//! Error types for DOM canonicalisation

use thiserror::Error;

/// Result type alias using the DOM error
pub type Result<T> = std::result::Result<T, DomError>;

#[derive(Error, Debug)]
pub enum DomError {
    #[error("Invalid DOM snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("Invalid diff option: {0}")]
    InvalidOption(String),
}
