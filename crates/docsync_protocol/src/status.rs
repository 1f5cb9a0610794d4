//! Backend status codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status codes the backend reports when a stream or a request fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// Success.
    Ok,
    /// The operation was cancelled.
    Cancelled,
    /// Unknown error.
    Unknown,
    /// The client sent an invalid argument.
    InvalidArgument,
    /// The deadline expired.
    DeadlineExceeded,
    /// A requested entity was not found.
    NotFound,
    /// The entity already exists.
    AlreadyExists,
    /// The caller lacks permission.
    PermissionDenied,
    /// A quota or rate limit was hit.
    ResourceExhausted,
    /// The system is not in the state required for the operation.
    FailedPrecondition,
    /// The operation was aborted, usually by a concurrency conflict.
    Aborted,
    /// The operation ran past the valid range.
    OutOfRange,
    /// The operation is not implemented.
    Unimplemented,
    /// An internal backend error.
    Internal,
    /// The service is unavailable.
    Unavailable,
    /// Unrecoverable data loss.
    DataLoss,
    /// The request lacks valid credentials.
    Unauthenticated,
}

impl Code {
    /// True if the error will not go away by retrying the stream.
    ///
    /// `Ok` is not an error and reports `false`.
    pub fn is_permanent_error(self) -> bool {
        match self {
            Code::Ok
            | Code::Cancelled
            | Code::Unknown
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Internal
            | Code::Unavailable
            | Code::Unauthenticated => false,
            Code::InvalidArgument
            | Code::NotFound
            | Code::AlreadyExists
            | Code::PermissionDenied
            | Code::FailedPrecondition
            | Code::Aborted
            | Code::OutOfRange
            | Code::Unimplemented
            | Code::DataLoss => true,
        }
    }

    /// Like [`Code::is_permanent_error`], but `Aborted` writes are retried.
    pub fn is_permanent_write_error(self) -> bool {
        self.is_permanent_error() && self != Code::Aborted
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "ok",
            Code::Cancelled => "cancelled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid-argument",
            Code::DeadlineExceeded => "deadline-exceeded",
            Code::NotFound => "not-found",
            Code::AlreadyExists => "already-exists",
            Code::PermissionDenied => "permission-denied",
            Code::ResourceExhausted => "resource-exhausted",
            Code::FailedPrecondition => "failed-precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out-of-range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data-loss",
            Code::Unauthenticated => "unauthenticated",
        };
        f.write_str(name)
    }
}

/// A status code with a human readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    /// The code.
    pub code: Code,
    /// Details from the backend.
    pub message: String,
}

impl RpcStatus {
    /// Creates a status.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
