//! Snapshots raised to query listeners and the change sets they carry.

use docsync_model::{Document, DocumentKey, DocumentKeySet, DocumentSet, Query};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// How a document changed within a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// The document entered the view.
    Added,
    /// The document left the view.
    Removed,
    /// The document's contents changed.
    Modified,
    /// Only the pending-write state changed.
    Metadata,
}

impl ChangeType {
    /// Sort rank within a snapshot: removals first, then additions, then
    /// modifications. Metadata changes surface as modifications and sort with
    /// them.
    pub fn rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

/// One document change in a view.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentViewChange {
    /// What happened.
    pub kind: ChangeType,
    /// The document after the change, or before it for removals.
    pub doc: Document,
}

impl DocumentViewChange {
    /// Creates a change.
    pub fn new(kind: ChangeType, doc: Document) -> Self {
        Self { kind, doc }
    }
}

/// Accumulates view changes, merging successive changes to the same key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a pending change.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// True if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Records `change`, folding it into any earlier change to the same key.
    ///
    /// # Panics
    ///
    /// Panics on combinations that cannot happen, such as a metadata change
    /// after a removal.
    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.doc.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::{Added, Metadata, Modified, Removed};
        let merged = match (old.kind, change.kind) {
            (Metadata, new) if new != Added => Some(change),
            (old_kind, Metadata) if old_kind != Removed => Some(DocumentViewChange::new(old_kind, change.doc)),
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.doc)),
            (Added, Modified) => Some(DocumentViewChange::new(Added, change.doc)),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(Removed, old.doc.clone())),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.doc)),
            (old_kind, new_kind) => {
                panic!("unsupported combination of changes for {key}: {new_kind:?} after {old_kind:?}")
            }
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    /// The merged changes in key order.
    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

/// Whether a view reflects the backend or only the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Results may be stale or include limbo documents.
    Local,
    /// Results are consistent with the backend.
    Synced,
}

/// The state of a query's results at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    /// The query.
    pub query: Query,
    /// Current results in query order.
    pub docs: DocumentSet,
    /// Results of the previous snapshot.
    pub old_docs: DocumentSet,
    /// Changes from `old_docs` to `docs`, removals first.
    pub doc_changes: Vec<DocumentViewChange>,
    /// Keys with local writes not yet acknowledged.
    pub mutated_keys: DocumentKeySet,
    /// True if the results came from cache rather than a synced target.
    pub from_cache: bool,
    /// True if `from_cache` flipped with this snapshot.
    pub sync_state_changed: bool,
    /// True if metadata-only changes were left out.
    pub excludes_metadata_changes: bool,
}

impl ViewSnapshot {
    /// A snapshot in which every document of `documents` was just added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
        excludes_metadata_changes: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|doc| DocumentViewChange::new(ChangeType::Added, doc.clone()))
            .collect();
        Self {
            old_docs: documents.empty_like(),
            query,
            docs: documents,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes,
        }
    }

    /// True if any document in the results has a pending local write.
    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// True if every change is a metadata change.
    pub fn is_metadata_only(&self) -> bool {
        self.doc_changes.iter().all(|change| change.kind == ChangeType::Metadata)
    }
}

/// Orders changes by type rank, then with `comparator` for equal ranks.
pub(crate) fn compare_changes(
    a: &DocumentViewChange,
    b: &DocumentViewChange,
    comparator: impl Fn(&Document, &Document) -> Ordering,
) -> Ordering {
    a.kind.rank().cmp(&b.kind.rank()).then_with(|| comparator(&a.doc, &b.doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::{DocumentState, FieldValue, ObjectValue, SnapshotVersion};

    fn doc(path: &str, n: i32) -> Document {
        Document::new(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            ObjectValue::from_fields([("n", FieldValue::from(n))]),
            DocumentState::Synced,
        )
    }

    fn merged(first: ChangeType, second: ChangeType) -> Vec<DocumentViewChange> {
        let mut set = DocumentChangeSet::new();
        set.track(DocumentViewChange::new(first, doc("c/a", 1)));
        set.track(DocumentViewChange::new(second, doc("c/a", 2)));
        set.changes()
    }

    #[test]
    fn successive_changes_merge() {
        use ChangeType::*;
        assert!(merged(Added, Removed).is_empty());
        assert_eq!(merged(Added, Modified), vec![DocumentViewChange::new(Added, doc("c/a", 2))]);
        assert_eq!(merged(Removed, Added), vec![DocumentViewChange::new(Modified, doc("c/a", 2))]);
        assert_eq!(merged(Modified, Removed), vec![DocumentViewChange::new(Removed, doc("c/a", 1))]);
        assert_eq!(merged(Metadata, Modified), vec![DocumentViewChange::new(Modified, doc("c/a", 2))]);
        assert_eq!(merged(Metadata, Removed), vec![DocumentViewChange::new(Removed, doc("c/a", 2))]);
        assert_eq!(merged(Modified, Metadata), vec![DocumentViewChange::new(Modified, doc("c/a", 2))]);
    }

    #[test]
    #[should_panic(expected = "unsupported combination")]
    fn metadata_after_removal_is_rejected() {
        merged(ChangeType::Removed, ChangeType::Metadata);
    }

    #[test]
    fn removals_sort_first() {
        let removed = DocumentViewChange::new(ChangeType::Removed, doc("c/z", 1));
        let added = DocumentViewChange::new(ChangeType::Added, doc("c/a", 1));
        let by_key = |a: &Document, b: &Document| Document::compare_by_key(a, b);
        assert_eq!(compare_changes(&removed, &added, by_key), Ordering::Less);
    }

    #[test]
    fn initial_snapshots_add_every_document() {
        let query = Query::at_path(docsync_model::ResourcePath::from_string("c").unwrap());
        let docs = DocumentSet::new(query.comparator()).add(doc("c/a", 1)).add(doc("c/b", 2));
        let snapshot = ViewSnapshot::from_initial_documents(query, docs, DocumentKeySet::new(), true, false);
        assert_eq!(snapshot.doc_changes.len(), 2);
        assert!(snapshot.old_docs.is_empty());
        assert!(!snapshot.has_pending_writes());
    }
}
