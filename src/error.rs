//! Error types for the response cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the response cache
#[derive(Error, Debug)]
pub enum Error {
    /// Requested cache name or request key is absent
    #[error("not found")]
    NotFound,

    /// Creation collided with an existing entry
    #[error("already exists")]
    Exists,

    /// Generic backend/storage failure
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True if this is the not-found kind
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// Shorthand for a storage error with a formatted reason
    pub fn storage(reason: impl Into<String>) -> Self {
        Error::Storage(reason.into())
    }
}
