//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested key is not stored.
    #[error("not found: {0}")]
    NotFound(String),

    /// Walking the store directory failed.
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// A specialized Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
