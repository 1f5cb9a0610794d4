//! Error types for the document model.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while constructing model values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// A path string or segment list is not valid for its use.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A query or filter was built with an unsupported combination.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ModelError {
    /// Creates an invalid path error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ModelError::invalid_path("rooms", "odd number of segments");
        assert_eq!(
            err.to_string(),
            "invalid path 'rooms': odd number of segments"
        );
        assert!(ModelError::invalid_argument("bad").to_string().contains("bad"));
    }
}
