//! Consistent batches of changes raised from the watch stream.

use bytes::Bytes;
use docsync_model::{DocumentKeySet, MaybeDocumentMap, SnapshotVersion, TargetId};
use std::collections::{BTreeMap, BTreeSet};

/// Changes to one target's membership since the last remote event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TargetChange {
    /// Resume cursor; empty if unchanged.
    pub resume_token: Bytes,
    /// True if the target is consistent with the backend as of this event.
    pub current: bool,
    /// Keys that joined the target.
    pub added_documents: DocumentKeySet,
    /// Keys that stayed but changed.
    pub modified_documents: DocumentKeySet,
    /// Keys that left the target.
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    /// A change that only updates the `current` flag.
    pub fn synthesized_current_change(current: bool) -> Self {
        Self {
            current,
            ..Self::default()
        }
    }

    /// Total number of documents touched.
    pub fn document_change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}

/// Everything that changed between two consistent watch snapshots.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteEvent {
    /// Snapshot version the event is consistent at; MIN for synthesized
    /// events.
    pub snapshot_version: SnapshotVersion,
    /// Per-target membership changes.
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter failed; they are re-listened without a
    /// resume token.
    pub target_mismatches: BTreeSet<TargetId>,
    /// New document states.
    pub document_updates: MaybeDocumentMap,
    /// Updated keys that only limbo resolution targets care about.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    /// An event that only updates the `current` flag of `target_id`.
    pub fn synthesized_current_change(target_id: TargetId, current: bool) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(target_id, TargetChange::synthesized_current_change(current));
        Self {
            snapshot_version: SnapshotVersion::MIN,
            target_changes,
            ..Self::default()
        }
    }
}
