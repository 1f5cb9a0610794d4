//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The storage backend cannot be reached right now.
    ///
    /// Callers should take the network offline and probe until access
    /// recovers.
    #[error("persistence unavailable: {0}")]
    Unavailable(String),

    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Stored data violates an internal invariant.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A caller violated a storage contract.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The persistence layer was shut down.
    #[error("persistence is shut down")]
    Closed,
}

impl StorageError {
    /// Creates an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Returns true if the error means persistence access failed and may
    /// recover on retry.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_failure_classification() {
        assert!(StorageError::unavailable("disk").is_persistence_failure());
        assert!(!StorageError::not_found("batch:3").is_persistence_failure());
        assert!(!StorageError::Closed.is_persistence_failure());
        assert_eq!(StorageError::Closed.to_string(), "persistence is shut down");
    }
}
