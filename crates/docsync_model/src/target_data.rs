//! Per-target metadata kept by the target cache.

use crate::query::Target;
use crate::types::{ListenSequenceNumber, TargetId};
use crate::version::SnapshotVersion;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a target is being listened to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetPurpose {
    /// A regular application query.
    Listen,
    /// Re-listen after an existence filter reported a count mismatch.
    ExistenceFilterMismatch,
    /// Single-document listen resolving a limbo document.
    LimboResolution,
}

impl fmt::Display for TargetPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetPurpose::Listen => "listen",
            TargetPurpose::ExistenceFilterMismatch => "existence-filter-mismatch",
            TargetPurpose::LimboResolution => "limbo-resolution",
        })
    }
}

/// A target plus the bookkeeping needed to resume it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    /// The backend descriptor.
    pub target: Target,
    /// Id assigned when the target was first listened to.
    pub target_id: TargetId,
    /// Why the target exists.
    pub purpose: TargetPurpose,
    /// Sequence number of the last transaction that used the target.
    pub sequence_number: ListenSequenceNumber,
    /// Latest consistent snapshot the target was synced to.
    pub snapshot_version: SnapshotVersion,
    /// Latest snapshot at which the target had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque resume cursor; empty when unknown.
    pub resume_token: Bytes,
}

impl TargetData {
    /// Creates metadata for a new target.
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::MIN,
            last_limbo_free_snapshot_version: SnapshotVersion::MIN,
            resume_token: Bytes::new(),
        }
    }

    /// Returns a copy with a new sequence number.
    #[must_use]
    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// Returns a copy with a new resume token and snapshot version.
    #[must_use]
    pub fn with_resume_token(&self, resume_token: Bytes, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            ..self.clone()
        }
    }

    /// Returns a copy with a new limbo-free snapshot version.
    #[must_use]
    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ResourcePath;
    use crate::query::Query;

    #[test]
    fn builders_keep_other_fields() {
        let target = Query::at_path(ResourcePath::from_string("rooms").unwrap()).to_target();
        let data = TargetData::new(target, TargetId(2), TargetPurpose::Listen, ListenSequenceNumber(1));
        assert!(data.resume_token.is_empty());

        let version = SnapshotVersion::from_micros(5);
        let resumed = data
            .with_resume_token(Bytes::from_static(b"r"), version)
            .with_sequence_number(ListenSequenceNumber(4));
        assert_eq!(resumed.snapshot_version, version);
        assert_eq!(resumed.sequence_number, ListenSequenceNumber(4));
        assert_eq!(resumed.target_id, TargetId(2));
        assert_eq!(resumed.last_limbo_free_snapshot_version, SnapshotVersion::MIN);
    }
}
