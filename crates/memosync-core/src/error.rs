//! Error types for memosync-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using memosync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in memosync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Memo or resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource blob storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Remote service error
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The account's operation queue has shut down
    #[error("Operation queue closed")]
    QueueClosed,
}

impl Error {
    /// Whether this error means the remote rejected our credentials.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Remote(remote) if remote.is_auth_failure())
    }
}
