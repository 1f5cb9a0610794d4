//! Error types for the sync engine.

use docsync_model::ModelError;
use docsync_protocol::{Code, ProtocolError, RpcStatus};
use docsync_storage::StorageError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the sync engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The backend rejected a request or closed a stream.
    #[error("rpc error ({code}): {message}")]
    Rpc {
        /// Backend status code.
        code: Code,
        /// Details from the backend.
        message: String,
    },

    /// Local persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A query or path was malformed.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// No credential could be obtained.
    #[error("credentials error: {0}")]
    Credentials(String),

    /// The operation needs the network, which is disabled.
    #[error("network is disabled")]
    NetworkDisabled,

    /// The client has been shut down.
    #[error("client is shut down")]
    Shutdown,
}

impl EngineError {
    /// Creates an rpc error.
    pub fn rpc(code: Code, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Returns true if retrying the stream may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Rpc { code, .. } => !code.is_permanent_error(),
            EngineError::Storage(err) => err.is_persistence_failure(),
            EngineError::Credentials(_) => true,
            _ => false,
        }
    }

    /// True if local persistence is temporarily unusable.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, EngineError::Storage(err) if err.is_persistence_failure())
    }

    /// The status a stream reports when it fails with this error.
    pub fn to_status(&self) -> RpcStatus {
        match self {
            EngineError::Rpc { code, message } => RpcStatus::new(*code, message.clone()),
            EngineError::Credentials(message) => RpcStatus::new(Code::Unauthenticated, message.clone()),
            EngineError::Shutdown => RpcStatus::new(Code::Cancelled, self.to_string()),
            other => RpcStatus::new(Code::Unknown, other.to_string()),
        }
    }
}

impl From<RpcStatus> for EngineError {
    fn from(status: RpcStatus) -> Self {
        Self::Rpc {
            code: status.code,
            message: status.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(EngineError::rpc(Code::Unavailable, "down").is_retryable());
        assert!(!EngineError::rpc(Code::PermissionDenied, "no").is_retryable());
        assert!(EngineError::Storage(StorageError::unavailable("disk")).is_retryable());
        assert!(!EngineError::Storage(StorageError::corrupted("bad")).is_retryable());
        assert!(!EngineError::Shutdown.is_retryable());
    }

    #[test]
    fn status_conversion() {
        let err: EngineError = RpcStatus::new(Code::NotFound, "gone").into();
        assert_eq!(err, EngineError::rpc(Code::NotFound, "gone"));
        assert_eq!(err.to_status(), RpcStatus::new(Code::NotFound, "gone"));
        assert_eq!(
            EngineError::Credentials("expired".into()).to_status().code,
            Code::Unauthenticated
        );
    }

    #[test]
    fn error_display() {
        assert_eq!(EngineError::NetworkDisabled.to_string(), "network is disabled");
        assert!(EngineError::rpc(Code::Aborted, "conflict")
            .to_string()
            .contains("aborted"));
    }
}
