//! Folding watch stream messages into remote events.

use crate::core::ChangeType;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use bytes::Bytes;
use docsync_model::{
    DocumentKey, DocumentKeySet, MaybeDocument, MaybeDocumentMap, NoDocument, SnapshotVersion, TargetData, TargetId,
    TargetPurpose,
};
use docsync_protocol::{ListenResponse, RpcStatus, TargetChangeKind};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// A document entering, changing in, or leaving targets.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    /// Targets the document now matches.
    pub updated_target_ids: Vec<TargetId>,
    /// Targets the document no longer matches.
    pub removed_target_ids: Vec<TargetId>,
    /// The document key.
    pub key: DocumentKey,
    /// The new state; `None` when the document only left targets.
    pub new_doc: Option<MaybeDocument>,
}

/// A change to the state of some targets.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    /// What happened.
    pub state: TargetChangeKind,
    /// The targets; empty means every active target.
    pub target_ids: Vec<TargetId>,
    /// New resume cursor, possibly empty.
    pub resume_token: Bytes,
    /// Why the targets were removed.
    pub cause: Option<RpcStatus>,
}

/// The backend's document count for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistenceFilterChange {
    /// The target.
    pub target_id: TargetId,
    /// Number of documents the backend holds for it.
    pub count: usize,
}

/// A decoded watch stream message.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    /// A document change.
    Document(DocumentWatchChange),
    /// A target state change.
    Target(WatchTargetChange),
    /// An existence filter.
    ExistenceFilter(ExistenceFilterChange),
}

impl WatchChange {
    /// Converts a watch response into a change and the snapshot version it
    /// carries. Only global target changes carry a version; all other
    /// messages report MIN.
    pub fn from_response(response: ListenResponse) -> (Self, SnapshotVersion) {
        match response {
            ListenResponse::TargetChange {
                kind,
                target_ids,
                resume_token,
                cause,
                read_time,
            } => {
                let version = if target_ids.is_empty() {
                    read_time.unwrap_or(SnapshotVersion::MIN)
                } else {
                    SnapshotVersion::MIN
                };
                let change = WatchChange::Target(WatchTargetChange {
                    state: kind,
                    target_ids,
                    resume_token,
                    cause,
                });
                (change, version)
            }
            ListenResponse::DocumentChange {
                document,
                target_ids,
                removed_target_ids,
            } => {
                let key = document.key.clone();
                let change = WatchChange::Document(DocumentWatchChange {
                    updated_target_ids: target_ids,
                    removed_target_ids,
                    key,
                    new_doc: Some(document.into_document().into()),
                });
                (change, SnapshotVersion::MIN)
            }
            ListenResponse::DocumentDelete {
                key,
                read_time,
                removed_target_ids,
            } => {
                let doc = NoDocument::new(key.clone(), read_time, false);
                let change = WatchChange::Document(DocumentWatchChange {
                    updated_target_ids: Vec::new(),
                    removed_target_ids,
                    key,
                    new_doc: Some(doc.into()),
                });
                (change, SnapshotVersion::MIN)
            }
            ListenResponse::DocumentRemove { key, removed_target_ids } => {
                let change = WatchChange::Document(DocumentWatchChange {
                    updated_target_ids: Vec::new(),
                    removed_target_ids,
                    key,
                    new_doc: None,
                });
                (change, SnapshotVersion::MIN)
            }
            ListenResponse::ExistenceFilter { target_id, count } => (
                WatchChange::ExistenceFilter(ExistenceFilterChange { target_id, count }),
                SnapshotVersion::MIN,
            ),
        }
    }
}

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the local cache holds for a target as of the last remote event.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// Metadata of a target the client listens to, or `None` if it no longer
    /// does.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

/// Accumulated state for one target between remote events.
#[derive(Debug, Clone)]
struct TargetState {
    /// Outstanding add/remove requests; the target is active only at zero.
    pending_responses: i32,
    current: bool,
    resume_token: Bytes,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            current: false,
            resume_token: Bytes::new(),
            document_changes: BTreeMap::new(),
            // Forces a first event so that the target can be marked current.
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: Bytes) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token;
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => change.added_documents = change.added_documents.insert(key.clone()),
                ChangeType::Modified => change.modified_documents = change.modified_documents.insert(key.clone()),
                ChangeType::Removed => change.removed_documents = change.removed_documents.insert(key.clone()),
                ChangeType::Metadata => panic!("metadata changes are never tracked per target"),
            }
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Accumulates watch changes until the backend declares a consistent
/// snapshot, then emits them as one [`RemoteEvent`].
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: HashMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MaybeDocument>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeSet<TargetId>,
}

impl WatchChangeAggregator {
    /// Creates an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes a document change.
    pub fn handle_document_change(&mut self, change: &DocumentWatchChange, metadata: &dyn TargetMetadataProvider) {
        for &target_id in &change.updated_target_ids {
            match &change.new_doc {
                Some(doc @ MaybeDocument::Document(_)) => {
                    self.add_document_to_target(target_id, doc.clone(), metadata);
                }
                Some(doc) => {
                    self.remove_document_from_target(target_id, &change.key, Some(doc.clone()), metadata);
                }
                None => {}
            }
        }
        for &target_id in &change.removed_target_ids {
            self.remove_document_from_target(target_id, &change.key, change.new_doc.clone(), metadata);
        }
    }

    /// Processes a target change.
    pub fn handle_target_change(&mut self, change: &WatchTargetChange, metadata: &dyn TargetMetadataProvider) {
        for target_id in self.target_ids_or_all(&change.target_ids, metadata) {
            match change.state {
                TargetChangeKind::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(change.resume_token.clone());
                    }
                }
                TargetChangeKind::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A target added twice while a change was in flight
                        // resets its document changes.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(change.resume_token.clone());
                }
                TargetChangeKind::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    assert!(change.cause.is_none(), "target removals with a cause are handled upstream");
                }
                TargetChangeKind::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(change.resume_token.clone());
                    }
                }
                TargetChangeKind::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(change.resume_token.clone());
                    }
                }
            }
        }
    }

    /// Compares the backend's document count with the local count and resets
    /// the target on mismatch.
    pub fn handle_existence_filter(&mut self, filter: &ExistenceFilterChange, metadata: &dyn TargetMetadataProvider) {
        let target_id = filter.target_id;
        let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
            return;
        };
        let target = &target_data.target;
        if target.is_document_target() {
            if filter.count == 0 {
                // The single document is gone. Its delete time is unknown, so
                // record it as absent at MIN.
                if let Ok(key) = DocumentKey::from_path(target.path.clone()) {
                    let doc = NoDocument::new(key.clone(), SnapshotVersion::MIN, false);
                    self.remove_document_from_target(target_id, &key, Some(doc.into()), metadata);
                }
            } else {
                assert_eq!(filter.count, 1, "single document existence filter with count {}", filter.count);
            }
        } else {
            let current_size = self.current_document_count_for_target(target_id, metadata);
            if current_size != filter.count {
                debug!(
                    %target_id,
                    expected = filter.count,
                    actual = current_size,
                    "existence filter mismatch, resetting target"
                );
                self.reset_target(target_id, metadata);
                self.pending_target_resets.insert(target_id);
            }
        }
    }

    /// Drains everything accumulated so far into one event at
    /// `snapshot_version`.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();

        let mut target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        target_ids.sort();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let current = self.target_states.get(&target_id).is_some_and(|s| s.current);
            if current && target_data.target.is_document_target() {
                // A current document target whose document never arrived
                // means the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(target_id, &key, metadata)
                    {
                        let doc = NoDocument::new(key.clone(), snapshot_version, false);
                        self.remove_document_from_target(target_id, &key, Some(doc.into()), metadata);
                    }
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|&target_id| {
                self.target_data_for_active_target(target_id, metadata)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo {
                resolved_limbo_documents = resolved_limbo_documents.insert(key.clone());
            }
        }

        let document_updates: MaybeDocumentMap = std::mem::take(&mut self.pending_document_updates)
            .into_iter()
            .collect();
        let event = RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        };
        self.pending_document_target_mapping.clear();
        event
    }

    /// Counts a listen or unlisten request whose response is outstanding.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    /// Forgets a target.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target(&mut self, target_id: TargetId, doc: MaybeDocument, metadata: &dyn TargetMetadataProvider) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = doc.key().clone();
        let change_type = if self.target_contains_document(target_id, &key, metadata) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), doc);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// Removes a document from a target. `updated_doc` records the new state
    /// when the removal is due to a delete.
    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_doc: Option<MaybeDocument>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let contained = self.target_contains_document(target_id, key, metadata);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Added and removed within the same event; nothing to report.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(doc) = updated_doc {
            self.pending_document_updates.insert(key.clone(), doc);
        }
    }

    fn reset_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) {
        let state = self.ensure_target_state(target_id);
        assert!(!state.is_pending(), "reset of target {target_id} with pending requests");
        *state = TargetState::default();

        // Everything the cache holds must be re-sent by the backend.
        let existing_keys = metadata.get_remote_keys_for_target(target_id);
        for key in existing_keys.iter() {
            self.remove_document_from_target(target_id, key, None, metadata);
        }
    }

    fn current_document_count_for_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> usize {
        let remote = metadata.get_remote_keys_for_target(target_id).len();
        let Some(state) = self.target_states.get(&target_id) else {
            return remote;
        };
        let change = state.to_target_change();
        (remote + change.added_documents.len()).saturating_sub(change.removed_documents.len())
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn target_ids_or_all(&self, target_ids: &[TargetId], metadata: &dyn TargetMetadataProvider) -> Vec<TargetId> {
        if !target_ids.is_empty() {
            return target_ids.to_vec();
        }
        let mut all: Vec<TargetId> = self
            .target_states
            .keys()
            .copied()
            .filter(|&id| self.is_active_target(id, metadata))
            .collect();
        all.sort();
        all
    }

    fn is_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> bool {
        self.target_data_for_active_target(target_id, metadata).is_some()
    }

    /// Metadata for a target that is listened to and has no outstanding
    /// requests.
    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => metadata.get_target_data_for_target(target_id),
        }
    }

    fn target_contains_document(
        &self,
        target_id: TargetId,
        key: &DocumentKey,
        metadata: &dyn TargetMetadataProvider,
    ) -> bool {
        metadata.get_remote_keys_for_target(target_id).contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::{
        Document, DocumentState, FieldValue, ListenSequenceNumber, ObjectValue, Query, ResourcePath, Target,
    };

    #[derive(Default)]
    struct Metadata {
        targets: HashMap<TargetId, TargetData>,
        remote_keys: HashMap<TargetId, DocumentKeySet>,
    }

    impl Metadata {
        fn with_query_target(mut self, id: i32, path: &str) -> Self {
            let target = Query::at_path(ResourcePath::from_string(path).unwrap()).to_target();
            self.targets.insert(
                TargetId(id),
                TargetData::new(target, TargetId(id), TargetPurpose::Listen, ListenSequenceNumber::new(1)),
            );
            self
        }

        fn with_limbo_target(mut self, id: i32, key: &str) -> Self {
            let target = Target::for_document(&DocumentKey::from_string(key).unwrap());
            self.targets.insert(
                TargetId(id),
                TargetData::new(target, TargetId(id), TargetPurpose::LimboResolution, ListenSequenceNumber::INVALID),
            );
            self
        }

        fn with_remote_keys(mut self, id: i32, keys: &[&str]) -> Self {
            let set = keys
                .iter()
                .map(|k| DocumentKey::from_string(k).unwrap())
                .collect();
            self.remote_keys.insert(TargetId(id), set);
            self
        }
    }

    impl TargetMetadataProvider for Metadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, version: i64) -> MaybeDocument {
        Document::new(
            key(path),
            SnapshotVersion::from_micros(version),
            ObjectValue::from_fields([("v", FieldValue::from(1))]),
            DocumentState::Synced,
        )
        .into()
    }

    fn doc_change(updated: &[i32], removed: &[i32], doc: MaybeDocument) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: updated.iter().map(|&id| TargetId(id)).collect(),
            removed_target_ids: removed.iter().map(|&id| TargetId(id)).collect(),
            key: doc.key().clone(),
            new_doc: Some(doc),
        }
    }

    fn target_change(state: TargetChangeKind, ids: &[i32], token: &'static [u8]) -> WatchTargetChange {
        WatchTargetChange {
            state,
            target_ids: ids.iter().map(|&id| TargetId(id)).collect(),
            resume_token: Bytes::from_static(token),
            cause: None,
        }
    }

    #[test]
    fn added_documents_are_reported_per_target() {
        let metadata = Metadata::default().with_query_target(2, "rooms");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_document_change(&doc_change(&[2], &[], doc("rooms/a", 1)), &metadata);
        aggregator.handle_target_change(&target_change(TargetChangeKind::Current, &[2], b"t1"), &metadata);

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(1), &metadata);
        let change = &event.target_changes[&TargetId(2)];
        assert!(change.current);
        assert_eq!(change.resume_token, Bytes::from_static(b"t1"));
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert_eq!(event.document_updates.len(), 1);
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn second_event_has_no_target_changes() {
        let metadata = Metadata::default().with_query_target(2, "rooms");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_target_change(&target_change(TargetChangeKind::Current, &[2], b"t1"), &metadata);
        let first = aggregator.create_remote_event(SnapshotVersion::from_micros(1), &metadata);
        assert_eq!(first.target_changes.len(), 1);

        let second = aggregator.create_remote_event(SnapshotVersion::from_micros(2), &metadata);
        assert!(second.target_changes.is_empty());
        assert!(second.document_updates.is_empty());
    }

    #[test]
    fn pending_targets_ignore_changes() {
        let metadata = Metadata::default().with_query_target(2, "rooms");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(TargetId(2));
        aggregator.handle_document_change(&doc_change(&[2], &[], doc("rooms/a", 1)), &metadata);
        assert!(aggregator.pending_document_updates.is_empty());

        aggregator.handle_target_change(&target_change(TargetChangeKind::Added, &[2], b""), &metadata);
        aggregator.handle_document_change(&doc_change(&[2], &[], doc("rooms/a", 1)), &metadata);
        assert_eq!(aggregator.pending_document_updates.len(), 1);
    }

    #[test]
    fn existing_documents_are_modified_and_deletes_removed() {
        let metadata = Metadata::default()
            .with_query_target(2, "rooms")
            .with_remote_keys(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_document_change(&doc_change(&[2], &[], doc("rooms/a", 3)), &metadata);
        let delete = NoDocument::new(key("rooms/b"), SnapshotVersion::from_micros(3), false);
        aggregator.handle_document_change(&doc_change(&[], &[2], delete.into()), &metadata);

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(3), &metadata);
        let change = &event.target_changes[&TargetId(2)];
        assert!(change.modified_documents.contains(&key("rooms/a")));
        assert!(change.removed_documents.contains(&key("rooms/b")));
    }

    #[test]
    fn add_then_remove_in_one_event_cancels() {
        let metadata = Metadata::default().with_query_target(2, "rooms");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_document_change(&doc_change(&[2], &[], doc("rooms/a", 1)), &metadata);
        let removal = DocumentWatchChange {
            updated_target_ids: Vec::new(),
            removed_target_ids: vec![TargetId(2)],
            key: key("rooms/a"),
            new_doc: None,
        };
        aggregator.handle_document_change(&removal, &metadata);

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(1), &metadata);
        assert_eq!(event.target_changes[&TargetId(2)].document_change_count(), 0);
    }

    #[test]
    fn existence_filter_mismatch_resets_the_target() {
        let metadata = Metadata::default()
            .with_query_target(2, "rooms")
            .with_remote_keys(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_existence_filter(&ExistenceFilterChange { target_id: TargetId(2), count: 1 }, &metadata);

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5), &metadata);
        assert!(event.target_mismatches.contains(&TargetId(2)));
        let change = &event.target_changes[&TargetId(2)];
        assert_eq!(change.removed_documents.len(), 2);
        assert!(!change.current);
    }

    #[test]
    fn matching_existence_filter_changes_nothing() {
        let metadata = Metadata::default()
            .with_query_target(2, "rooms")
            .with_remote_keys(2, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_existence_filter(&ExistenceFilterChange { target_id: TargetId(2), count: 1 }, &metadata);
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5), &metadata);
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn current_document_target_without_document_synthesizes_delete() {
        let metadata = Metadata::default().with_limbo_target(1, "rooms/gone");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_target_change(&target_change(TargetChangeKind::Current, &[1], b"t"), &metadata);

        let version = SnapshotVersion::from_micros(9);
        let event = aggregator.create_remote_event(version, &metadata);
        let update = event.document_updates.get(&key("rooms/gone")).unwrap();
        assert_eq!(update, &MaybeDocument::from(NoDocument::new(key("rooms/gone"), version, false)));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/gone")));
    }

    #[test]
    fn documents_shared_with_query_targets_are_not_limbo_only() {
        let metadata = Metadata::default()
            .with_query_target(2, "rooms")
            .with_limbo_target(1, "rooms/a");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_document_change(&doc_change(&[1, 2], &[], doc("rooms/a", 1)), &metadata);
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(1), &metadata);
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn response_conversion_extracts_global_versions() {
        let version = SnapshotVersion::from_micros(4);
        let (_, global) = WatchChange::from_response(ListenResponse::global_snapshot(version, Bytes::new()));
        assert_eq!(global, version);

        let (change, scoped) = WatchChange::from_response(ListenResponse::TargetChange {
            kind: TargetChangeKind::Current,
            target_ids: vec![TargetId(2)],
            resume_token: Bytes::new(),
            cause: None,
            read_time: Some(version),
        });
        assert_eq!(scoped, SnapshotVersion::MIN);
        assert!(matches!(change, WatchChange::Target(_)));
    }
}
