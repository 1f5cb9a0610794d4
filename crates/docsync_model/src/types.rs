//! Identifier types shared across the sync core.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a watch target.
///
/// Ids allocated by the target cache are even, ids allocated by the sync
/// engine for limbo resolution are odd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetId(pub i32);

impl TargetId {
    /// Creates a new target ID.
    #[must_use]
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target:{}", self.0)
    }
}

/// Identifier of a mutation batch.
///
/// Batch IDs are monotonically increasing within one mutation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId(pub i32);

impl BatchId {
    /// Sentinel used when no batch is known.
    pub const UNKNOWN: BatchId = BatchId(-1);

    /// Creates a new batch ID.
    #[must_use]
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns the batch ID following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch:{}", self.0)
    }
}

/// Sequence number assigned to each persistence transaction.
///
/// Sequence numbers are used by reference-counted garbage collection to tell
/// which transaction last touched a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ListenSequenceNumber(pub i64);

impl ListenSequenceNumber {
    /// Sentinel for "no sequence number".
    pub const INVALID: ListenSequenceNumber = ListenSequenceNumber(-1);

    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: i64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ListenSequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// The authenticated identity whose writes are being queued.
///
/// Each user owns a separate mutation queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct User {
    uid: Option<String>,
}

impl User {
    /// The unauthenticated user.
    pub const UNAUTHENTICATED: User = User { uid: None };

    /// Creates an authenticated user.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    /// Returns the user id, if authenticated.
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// Returns true if this user is authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Returns a stable key usable for per-user storage.
    pub fn to_key(&self) -> String {
        self.uid.clone().unwrap_or_else(|| "anonymous-user".to_string())
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "user:{uid}"),
            None => write!(f, "user:<anonymous>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_id_ordering() {
        let b1 = BatchId::new(1);
        let b2 = b1.next();
        assert!(b1 < b2);
        assert!(BatchId::UNKNOWN < b1);
    }

    #[test]
    fn sequence_number_next() {
        let s1 = ListenSequenceNumber::new(5);
        assert_eq!(s1.next().as_i64(), 6);
    }

    #[test]
    fn target_id_display() {
        assert_eq!(format!("{}", TargetId::new(42)), "target:42");
    }

    #[test]
    fn user_keys() {
        assert_eq!(User::new("alice").to_key(), "alice");
        assert!(!User::UNAUTHENTICATED.is_authenticated());
        assert_ne!(User::new("a"), User::new("b"));
    }
}
