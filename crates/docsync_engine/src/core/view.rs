//! A query's materialized results and the limbo documents inside them.

use crate::core::view_snapshot::{
    compare_changes, ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::local::QueryResult;
use crate::remote::{OnlineState, TargetChange};
use docsync_model::{Document, DocumentKey, DocumentKeySet, DocumentSet, MaybeDocument, MaybeDocumentMap, Query};
use tracing::trace;

/// A key entering or leaving limbo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimboDocumentChange {
    /// The document matches locally but the server has not confirmed it.
    Added(DocumentKey),
    /// The document is no longer in limbo.
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    /// The affected key.
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Changes computed by [`View::compute_doc_changes`], not yet applied.
#[derive(Debug, Clone)]
pub struct ViewDocumentChanges {
    /// The results after the changes.
    pub document_set: DocumentSet,
    /// The changes to raise.
    pub change_set: DocumentChangeSet,
    /// True if a limit query lost its boundary and must be re-queried.
    pub needs_refill: bool,
    /// Keys with pending local writes after the changes.
    pub mutated_keys: DocumentKeySet,
}

/// The result of [`View::apply_changes`].
#[derive(Debug, Clone, Default)]
pub struct ViewChange {
    /// The snapshot to raise, if anything visible changed.
    pub snapshot: Option<ViewSnapshot>,
    /// Keys entering or leaving limbo.
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Results of one query, kept up to date with local and remote changes.
#[derive(Debug, Clone)]
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    /// True once the backend reported the target consistent.
    current: bool,
    document_set: DocumentSet,
    limbo_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
    /// Keys the backend last reported for the target.
    synced_documents: DocumentKeySet,
}

impl View {
    /// Creates an empty view. `synced_documents` are the target's remote keys.
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let document_set = DocumentSet::new(query.comparator());
        Self {
            query,
            sync_state: None,
            current: false,
            document_set,
            limbo_documents: DocumentKeySet::new(),
            mutated_keys: DocumentKeySet::new(),
            synced_documents,
        }
    }

    /// The view's query.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Keys the backend last reported as part of the target.
    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    /// Keys currently in limbo.
    pub fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    /// The current results.
    pub fn documents(&self) -> &DocumentSet {
        &self.document_set
    }

    /// Computes the effect of `doc_changes` without applying it.
    ///
    /// Pass the result of an earlier call as `previous_changes` to continue
    /// from it, as when refilling a limit query.
    ///
    /// # Panics
    ///
    /// Panics if a refill itself needs a refill.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &MaybeDocumentMap,
        previous_changes: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let refilling = previous_changes.is_some();
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous_changes {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (DocumentChangeSet::new(), self.document_set.clone(), self.mutated_keys.clone()),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit();
        let at_limit = limit == Some(old_document_set.len());
        let last_doc_in_limit = (self.query.has_limit_to_first() && at_limit)
            .then(|| old_document_set.last().cloned())
            .flatten();
        let first_doc_in_limit = (self.query.has_limit_to_last() && at_limit)
            .then(|| old_document_set.first().cloned())
            .flatten();
        let comparator = self.query.comparator();

        for (key, new_maybe_doc) in doc_changes.iter() {
            let old_doc = old_document_set.get(key);
            let new_doc = match new_maybe_doc {
                MaybeDocument::Document(doc) if self.query.matches(doc) => Some(doc),
                _ => None,
            };

            let old_doc_had_pending_mutations = old_doc.is_some() && self.mutated_keys.contains(key);
            let new_doc_has_pending_mutations = new_doc.is_some_and(|doc| {
                doc.has_local_mutations() || (self.mutated_keys.contains(key) && doc.has_committed_mutations())
            });

            let change_applied = match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if Self::should_wait_for_synced_document(old_doc, new_doc) {
                            false
                        } else {
                            change_set.track(DocumentViewChange::new(ChangeType::Modified, new_doc.clone()));
                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| comparator(new_doc, last).is_gt());
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| comparator(new_doc, first).is_lt());
                            if past_last || before_first {
                                // The document moved past the boundary; a
                                // document outside the view may now belong.
                                needs_refill = true;
                            }
                            true
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange::new(ChangeType::Metadata, new_doc.clone()));
                        true
                    } else {
                        false
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new_doc.clone()));
                    true
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()));
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        // A document left a full limit view.
                        needs_refill = true;
                    }
                    true
                }
                (None, None) => false,
            };

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        new_document_set = new_document_set.add(new_doc.clone());
                        new_mutated_keys = if new_doc.has_local_mutations() {
                            new_mutated_keys.insert(key.clone())
                        } else {
                            new_mutated_keys.remove(key)
                        };
                    }
                    None => {
                        new_document_set = new_document_set.delete(key);
                        new_mutated_keys = new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while new_document_set.len() > limit {
                let trimmed = if self.query.has_limit_to_first() {
                    new_document_set.last().cloned()
                } else {
                    new_document_set.first().cloned()
                };
                let Some(trimmed) = trimmed else { break };
                new_document_set = new_document_set.delete(trimmed.key());
                new_mutated_keys = new_mutated_keys.remove(trimmed.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, trimmed));
            }
        }

        assert!(
            !needs_refill || !refilling,
            "view was refilled using documents that themselves needed refilling"
        );

        ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            needs_refill,
            mutated_keys: new_mutated_keys,
        }
    }

    /// True if a locally modified document should keep its local contents
    /// until the backend confirms the write through watch.
    fn should_wait_for_synced_document(old_doc: &Document, new_doc: &Document) -> bool {
        old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
    }

    /// Applies computed changes and a target change, returning the snapshot
    /// to raise.
    ///
    /// Limbo documents are only recomputed when `update_limbo_documents` is
    /// set.
    ///
    /// # Panics
    ///
    /// Panics if `doc_changes` still needs a refill.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        assert!(!doc_changes.needs_refill, "cannot apply changes that need a refill");
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let comparator = self.query.comparator();
        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|a, b| compare_changes(a, b, |x, y| comparator(x, y)));

        self.apply_target_change(target_change);
        let limbo_changes = if update_limbo_documents {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                docs: self.document_set.clone(),
                old_docs,
                doc_changes: changes,
                mutated_keys: self.mutated_keys.clone(),
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
            }),
            limbo_changes,
        }
    }

    /// Going offline drops the `current` flag so listeners see cached
    /// results. Results are kept.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            self.apply_changes(unchanged, false, None)
        } else {
            ViewChange::default()
        }
    }

    /// Replaces the view's state with a query result read from persistence.
    pub fn synchronize_with_persisted_state(&mut self, query_result: QueryResult) -> ViewChange {
        self.synced_documents = query_result.remote_keys;
        self.limbo_documents = DocumentKeySet::new();
        let documents: MaybeDocumentMap = query_result
            .documents
            .iter()
            .map(|(key, doc)| (key.clone(), MaybeDocument::Document(doc.clone())))
            .collect();
        let changes = self.compute_doc_changes(&documents, None);
        self.apply_changes(changes, true, None)
    }

    /// A snapshot adding every current result, for a second listener.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
            false,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in change.added_documents.iter() {
            self.synced_documents = self.synced_documents.insert(key.clone());
        }
        for key in change.modified_documents.iter() {
            debug_assert!(
                self.synced_documents.contains(key),
                "modified document {key} not found in view"
            );
        }
        for key in change.removed_documents.iter() {
            self.synced_documents = self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let new_limbo: DocumentKeySet = self
            .document_set
            .iter()
            .filter(|doc| self.should_be_in_limbo(doc))
            .map(|doc| doc.key().clone())
            .collect();

        let mut changes = Vec::new();
        for key in old_limbo.iter().filter(|key| !new_limbo.contains(key)) {
            changes.push(LimboDocumentChange::Removed(key.clone()));
        }
        for key in new_limbo.iter().filter(|key| !old_limbo.contains(key)) {
            trace!(query = %self.query.canonical_id(), %key, "document entered limbo");
            changes.push(LimboDocumentChange::Added(key.clone()));
        }
        self.limbo_documents = new_limbo;
        changes
    }

    /// Local matches the server never confirmed, unless a local write
    /// explains them.
    fn should_be_in_limbo(&self, doc: &Document) -> bool {
        !self.synced_documents.contains(doc.key()) && !doc.has_local_mutations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::{
        Direction, DocumentState, FieldPath, FieldValue, NoDocument, ObjectValue, OrderBy, ResourcePath,
        SnapshotVersion,
    };

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc_with_state(path: &str, n: i32, state: DocumentState) -> Document {
        Document::new(
            key(path),
            SnapshotVersion::from_micros(1),
            ObjectValue::from_fields([("n", FieldValue::from(n))]),
            state,
        )
    }

    fn doc(path: &str, n: i32) -> Document {
        doc_with_state(path, n, DocumentState::Synced)
    }

    fn updates(docs: impl IntoIterator<Item = MaybeDocument>) -> MaybeDocumentMap {
        docs.into_iter().map(|doc| (doc.key().clone(), doc)).collect()
    }

    fn deleted(path: &str) -> MaybeDocument {
        NoDocument::new(key(path), SnapshotVersion::from_micros(2), false).into()
    }

    fn rooms() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap())
    }

    fn by_n() -> Query {
        rooms().with_order_by(OrderBy::new(FieldPath::new(["n"]), Direction::Ascending))
    }

    fn current_change(added: &[&str]) -> TargetChange {
        TargetChange {
            current: true,
            added_documents: added.iter().map(|p| key(p)).collect(),
            ..TargetChange::default()
        }
    }

    fn keys(snapshot: &ViewSnapshot) -> Vec<DocumentKey> {
        snapshot.docs.iter().map(|doc| doc.key().clone()).collect()
    }

    #[test]
    fn adds_and_removes_documents_in_query_order() {
        let mut view = View::new(by_n(), DocumentKeySet::new());
        let changes = view.compute_doc_changes(&updates([doc("rooms/b", 1).into(), doc("rooms/a", 2).into()]), None);
        let snapshot = view.apply_changes(changes, true, None).snapshot.unwrap();
        assert_eq!(keys(&snapshot), vec![key("rooms/b"), key("rooms/a")]);
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);

        let changes = view.compute_doc_changes(&updates([deleted("rooms/b")]), None);
        let snapshot = view.apply_changes(changes, true, None).snapshot.unwrap();
        assert_eq!(keys(&snapshot), vec![key("rooms/a")]);
        assert_eq!(snapshot.doc_changes[0].kind, ChangeType::Removed);
        assert!(!snapshot.sync_state_changed);
    }

    #[test]
    fn non_matching_documents_are_filtered() {
        let other = Query::at_path(ResourcePath::from_string("users").unwrap());
        let mut view = View::new(other, DocumentKeySet::new());
        let changes = view.compute_doc_changes(&updates([doc("rooms/a", 1).into()]), None);
        assert!(changes.document_set.is_empty());
        assert!(changes.change_set.is_empty());
        assert!(view.apply_changes(changes, true, None).snapshot.is_some());
    }

    #[test]
    fn empty_change_sets_are_idempotent() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        let changes = view.compute_doc_changes(&updates([doc("rooms/a", 1).into()]), None);
        view.apply_changes(changes, true, None);

        let first = view.compute_doc_changes(&MaybeDocumentMap::new(), None);
        let second = view.compute_doc_changes(&MaybeDocumentMap::new(), None);
        assert!(first.change_set.is_empty());
        assert_eq!(first.document_set, second.document_set);
        assert!(view.apply_changes(first, true, None).snapshot.is_none());
    }

    #[test]
    fn limit_queries_trim_and_request_refills() {
        let query = by_n().with_limit_to_first(2);
        let mut view = View::new(query, DocumentKeySet::new());
        let changes = view.compute_doc_changes(
            &updates([doc("rooms/a", 1).into(), doc("rooms/b", 2).into(), doc("rooms/c", 3).into()]),
            None,
        );
        assert_eq!(changes.document_set.len(), 2);
        assert!(!changes.needs_refill);
        let snapshot = view.apply_changes(changes, true, None).snapshot.unwrap();
        assert_eq!(keys(&snapshot), vec![key("rooms/a"), key("rooms/b")]);

        // Removing a document from a full limit view needs a refill.
        let changes = view.compute_doc_changes(&updates([deleted("rooms/a")]), None);
        assert!(changes.needs_refill);

        // Moving the boundary document past the limit needs one too.
        let changes = view.compute_doc_changes(&updates([doc("rooms/b", 9).into()]), None);
        assert!(changes.needs_refill);

        // A refill from persistence fills the gap.
        let changes = view.compute_doc_changes(&updates([deleted("rooms/a")]), None);
        let refilled = view.compute_doc_changes(&updates([doc("rooms/c", 3).into()]), Some(changes));
        assert!(!refilled.needs_refill);
        let snapshot = view.apply_changes(refilled, true, None).snapshot.unwrap();
        assert_eq!(keys(&snapshot), vec![key("rooms/b"), key("rooms/c")]);
    }

    #[test]
    fn limit_to_last_keeps_the_tail() {
        let query = by_n().with_limit_to_last(1);
        let mut view = View::new(query, DocumentKeySet::new());
        let changes = view.compute_doc_changes(&updates([doc("rooms/a", 1).into(), doc("rooms/b", 2).into()]), None);
        let snapshot = view.apply_changes(changes, true, None).snapshot.unwrap();
        assert_eq!(keys(&snapshot), vec![key("rooms/b")]);
    }

    #[test]
    fn unconfirmed_documents_enter_limbo_once_current() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        let changes = view.compute_doc_changes(&updates([doc("rooms/a", 1).into(), doc("rooms/b", 2).into()]), None);
        let change = view.apply_changes(changes, true, None);
        assert!(change.limbo_changes.is_empty());

        let changes = view.compute_doc_changes(&MaybeDocumentMap::new(), None);
        let change = view.apply_changes(changes, true, Some(&current_change(&["rooms/a"])));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Added(key("rooms/b"))]);
        assert!(change.snapshot.is_none());

        let changes = view.compute_doc_changes(&updates([deleted("rooms/b")]), None);
        let change = view.apply_changes(changes, true, None);
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Removed(key("rooms/b"))]);
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
    }

    #[test]
    fn local_writes_keep_documents_out_of_limbo() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        let local = doc_with_state("rooms/a", 1, DocumentState::LocalMutations);
        let changes = view.compute_doc_changes(&updates([local.into()]), None);
        let change = view.apply_changes(changes, true, Some(&current_change(&[])));
        assert!(change.limbo_changes.is_empty());
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.has_pending_writes());
        assert!(!snapshot.from_cache);
    }

    #[test]
    fn acknowledged_writes_wait_for_the_synced_document() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        let local = doc_with_state("rooms/a", 2, DocumentState::LocalMutations);
        let changes = view.compute_doc_changes(&updates([local.into()]), None);
        view.apply_changes(changes, true, Some(&current_change(&["rooms/a"])));

        // The ack carries different data than the local view; keep the local
        // contents until watch catches up.
        let committed = doc_with_state("rooms/a", 3, DocumentState::CommittedMutations);
        let changes = view.compute_doc_changes(&updates([committed.into()]), None);
        assert!(changes.change_set.is_empty());

        let synced = doc("rooms/a", 3);
        let changes = view.compute_doc_changes(&updates([synced.into()]), None);
        let snapshot = view.apply_changes(changes, true, None).snapshot.unwrap();
        assert_eq!(snapshot.doc_changes[0].kind, ChangeType::Modified);
        assert!(!snapshot.has_pending_writes());
    }

    #[test]
    fn metadata_changes_are_tracked() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        let local = doc_with_state("rooms/a", 1, DocumentState::LocalMutations);
        let changes = view.compute_doc_changes(&updates([local.into()]), None);
        view.apply_changes(changes, true, None);

        let changes = view.compute_doc_changes(&updates([doc("rooms/a", 1).into()]), None);
        let snapshot = view.apply_changes(changes, true, None).snapshot.unwrap();
        assert!(snapshot.is_metadata_only());
        assert!(!snapshot.has_pending_writes());
    }

    #[test]
    fn going_offline_marks_results_as_cached() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        let changes = view.compute_doc_changes(&updates([doc("rooms/a", 1).into()]), None);
        let snapshot = view
            .apply_changes(changes, true, Some(&current_change(&["rooms/a"])))
            .snapshot
            .unwrap();
        assert!(!snapshot.from_cache);

        let snapshot = view.apply_online_state_change(OnlineState::Offline).snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.doc_changes.is_empty());
        assert_eq!(snapshot.docs.len(), 1);
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }
}
