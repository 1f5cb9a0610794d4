//! Keys a view added or removed, fed back to pin documents locally.

use crate::core::{ChangeType, ViewSnapshot};
use docsync_model::{DocumentKeySet, TargetId};

/// The keys that entered and left one target's view in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalViewChanges {
    /// The target the view belongs to.
    pub target_id: TargetId,
    /// True if the snapshot was computed from cache.
    pub from_cache: bool,
    /// Keys that joined the view.
    pub added_keys: DocumentKeySet,
    /// Keys that left the view.
    pub removed_keys: DocumentKeySet,
}

impl LocalViewChanges {
    /// Collects the added and removed keys of `snapshot`.
    pub fn from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = DocumentKeySet::new();
        let mut removed_keys = DocumentKeySet::new();
        for change in &snapshot.doc_changes {
            match change.kind {
                ChangeType::Added => added_keys = added_keys.insert(change.doc.key().clone()),
                ChangeType::Removed => removed_keys = removed_keys.insert(change.doc.key().clone()),
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}
