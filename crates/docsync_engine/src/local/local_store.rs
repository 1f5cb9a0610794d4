//! The local store: the single entry point to persisted client state.

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::local::local_documents::LocalDocumentsView;
use crate::local::local_view_changes::LocalViewChanges;
use crate::local::query_engine::{IndexFreeQueryEngine, QueryEngine};
use crate::remote::{RemoteEvent, TargetChange};
use bytes::Bytes;
use docsync_model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, FieldMask, MaybeDocument, MaybeDocumentMap, Mutation,
    MutationBatch, MutationBatchResult, Query, SnapshotVersion, Target, TargetData, TargetId, TargetPurpose,
    Timestamp, User,
};
use docsync_storage::{
    MutationQueue, NullableMaybeDocumentMap, Persistence, PersistenceExt, ReferenceSet, StorageError,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// The outcome of a local write.
#[derive(Debug, Clone)]
pub struct LocalWriteResult {
    /// The id assigned to the new batch.
    pub batch_id: BatchId,
    /// The local view of every document the batch touched.
    pub changes: MaybeDocumentMap,
}

/// The outcome of switching users.
#[derive(Debug, Clone, Default)]
pub struct UserChangeResult {
    /// Batches of the previous user, no longer visible.
    pub removed_batch_ids: Vec<BatchId>,
    /// Batches of the new user, now visible.
    pub added_batch_ids: Vec<BatchId>,
    /// The local view of every document either user's batches touch.
    pub affected_documents: MaybeDocumentMap,
}

/// The outcome of a local query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Matching documents in the local view.
    pub documents: DocumentMap,
    /// Keys the server last reported for the query's target.
    pub remote_keys: DocumentKeySet,
}

struct LocalStoreState {
    user: User,
    mutation_queue: Arc<dyn MutationQueue>,
    local_documents: LocalDocumentsView,
    /// Targets with at least one active listener.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: HashMap<String, TargetId>,
}

impl LocalStoreState {
    fn cached_target_data(&self, target: &Target) -> Option<&TargetData> {
        let target_id = self.target_id_by_canonical_id.get(&target.canonical_id())?;
        self.target_data_by_target
            .get(target_id)
            .filter(|data| data.target == *target)
    }
}

/// Coordinates the mutation queue, the remote document cache and the
/// target cache.
///
/// Every operation runs in its own persistence transaction. Persistence
/// errors are never retried here; they propagate to the caller.
pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    query_engine: Box<dyn QueryEngine>,
    resume_token_max_age: Duration,
    local_view_references: Arc<RwLock<ReferenceSet>>,
    state: Mutex<LocalStoreState>,
}

impl LocalStore {
    /// Creates a local store for `user` over `persistence`.
    pub fn new(persistence: Arc<dyn Persistence>, config: &EngineConfig, user: User) -> Self {
        Self::with_query_engine(persistence, config, user, Box::new(IndexFreeQueryEngine::new()))
    }

    /// Creates a local store with a custom query engine.
    pub fn with_query_engine(
        persistence: Arc<dyn Persistence>,
        config: &EngineConfig,
        user: User,
        query_engine: Box<dyn QueryEngine>,
    ) -> Self {
        let local_view_references = Arc::new(RwLock::new(ReferenceSet::new()));
        persistence
            .reference_delegate()
            .set_in_memory_pins(local_view_references.clone());
        let mutation_queue = persistence.mutation_queue(&user);
        let local_documents = Self::local_documents_for(&*persistence, mutation_queue.clone());
        Self {
            persistence,
            query_engine,
            resume_token_max_age: config.resume_token_max_age,
            local_view_references,
            state: Mutex::new(LocalStoreState {
                user,
                mutation_queue,
                local_documents,
                target_data_by_target: BTreeMap::new(),
                target_id_by_canonical_id: HashMap::new(),
            }),
        }
    }

    fn local_documents_for(persistence: &dyn Persistence, mutation_queue: Arc<dyn MutationQueue>) -> LocalDocumentsView {
        LocalDocumentsView::new(
            persistence.remote_document_cache(),
            mutation_queue,
            persistence.index_manager(),
        )
    }

    /// Starts persistence if needed and validates the mutation queue.
    pub fn start(&self) -> EngineResult<()> {
        if !self.persistence.is_started() {
            self.persistence.start()?;
        }
        let state = self.state.lock();
        let queue = state.mutation_queue.clone();
        let empty = self.persistence.run_transaction("start local store", |txn| {
            queue.perform_consistency_check(txn)?;
            queue.check_empty(txn)
        })?;
        debug!(user = %state.user, queue_empty = empty, "local store started");
        Ok(())
    }

    /// The user whose mutation queue is active.
    pub fn current_user(&self) -> User {
        self.state.lock().user.clone()
    }

    /// Switches to `user`'s mutation queue.
    pub fn handle_user_change(&self, user: User) -> EngineResult<UserChangeResult> {
        let mut state = self.state.lock();
        let old_queue = state.mutation_queue.clone();
        let new_queue = self.persistence.mutation_queue(&user);
        let new_documents = Self::local_documents_for(&*self.persistence, new_queue.clone());

        let result = self.persistence.run_transaction("handle user change", |txn| {
            let old_batches = old_queue.get_all_mutation_batches(txn)?;
            let new_batches = new_queue.get_all_mutation_batches(txn)?;
            let changed_keys = old_batches
                .iter()
                .chain(&new_batches)
                .flat_map(|batch| batch.mutations.iter())
                .fold(DocumentKeySet::new(), |keys, mutation| keys.insert(mutation.key().clone()));
            Ok(UserChangeResult {
                removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
                affected_documents: new_documents.get_documents(txn, &changed_keys)?,
            })
        })?;

        info!(from = %state.user, to = %user, "switched mutation queue");
        state.user = user;
        state.mutation_queue = new_queue;
        state.local_documents = new_documents;
        Ok(result)
    }

    /// Queues `mutations` as one batch and returns the new local view.
    ///
    /// Base values for non-idempotent transforms are captured as patch
    /// mutations so that the local result does not drift while the batch is
    /// pending.
    pub fn local_write(&self, mutations: Vec<Mutation>) -> EngineResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys = mutations
            .iter()
            .fold(DocumentKeySet::new(), |keys, mutation| keys.insert(mutation.key().clone()));
        let state = self.state.lock();

        let result = self.persistence.run_transaction("locally write mutations", |txn| {
            let existing = state.local_documents.get_documents(txn, &keys)?;
            let base_mutations: Vec<Mutation> = mutations
                .iter()
                .filter_map(|mutation| {
                    let base = mutation.extract_base_value(existing.get(mutation.key()))?;
                    let mask = FieldMask::from_object(&base);
                    Some(Mutation::patch(mutation.key().clone(), base, mask))
                })
                .collect();
            let batch = state
                .mutation_queue
                .add_mutation_batch(txn, local_write_time, base_mutations, mutations)?;
            Ok(LocalWriteResult {
                batch_id: batch.batch_id,
                changes: batch.apply_to_local_document_set(&existing),
            })
        })?;
        debug!(batch_id = %result.batch_id, docs = result.changes.len(), "wrote batch locally");
        Ok(result)
    }

    /// The local view of the documents a queued batch touches.
    pub fn lookup_mutation_documents(&self, batch_id: BatchId) -> EngineResult<Option<MaybeDocumentMap>> {
        let state = self.state.lock();
        Ok(self.persistence.run_transaction("lookup mutation documents", |txn| {
            match state.mutation_queue.lookup_mutation_batch(txn, batch_id)? {
                Some(batch) => Ok(Some(state.local_documents.get_documents(txn, &batch.keys())?)),
                None => Ok(None),
            }
        })?)
    }

    /// Applies an acknowledged batch to the remote cache and drops it from
    /// the queue.
    pub fn acknowledge_batch(&self, batch_result: &MutationBatchResult) -> EngineResult<MaybeDocumentMap> {
        let state = self.state.lock();
        let remote_documents = self.persistence.remote_document_cache();
        let changes = self.persistence.run_transaction("acknowledge batch", |txn| {
            let batch = &batch_result.batch;
            let affected = batch.keys();
            let mut buffer = remote_documents.new_change_buffer();

            for key in affected.iter() {
                let remote_doc = buffer.get_entry(txn, key)?;
                let Some(ack_version) = batch_result.doc_versions.get(key).copied() else {
                    return Err(StorageError::corrupted(format!(
                        "batch {} acknowledged without a version for {key}",
                        batch.batch_id
                    )));
                };
                if remote_doc.as_ref().map_or(true, |doc| doc.version() < ack_version) {
                    if let Some(doc) = batch.apply_to_remote_document(key, remote_doc, batch_result) {
                        buffer.add_entry(doc, batch_result.commit_version);
                    }
                }
            }
            buffer.apply(txn)?;

            state
                .mutation_queue
                .set_last_stream_token(txn, batch_result.stream_token.clone())?;
            state.mutation_queue.remove_mutation_batch(txn, batch)?;
            state.mutation_queue.perform_consistency_check(txn)?;
            state.local_documents.get_documents(txn, &affected)
        })?;
        debug!(batch_id = %batch_result.batch.batch_id, version = %batch_result.commit_version, "acknowledged batch");
        Ok(changes)
    }

    /// Drops a rejected batch and returns the recomputed local view.
    pub fn reject_batch(&self, batch_id: BatchId) -> EngineResult<MaybeDocumentMap> {
        let state = self.state.lock();
        let changes = self.persistence.run_transaction("reject batch", |txn| {
            let Some(batch) = state.mutation_queue.lookup_mutation_batch(txn, batch_id)? else {
                return Err(StorageError::not_found(format!("rejected batch {batch_id} is not queued")));
            };
            let affected = batch.keys();
            state.mutation_queue.remove_mutation_batch(txn, &batch)?;
            state.mutation_queue.perform_consistency_check(txn)?;
            state.local_documents.get_documents(txn, &affected)
        })?;
        debug!(%batch_id, "rejected batch");
        Ok(changes)
    }

    /// The highest batch id not yet acknowledged, or `BatchId::UNKNOWN`.
    pub fn get_highest_unacknowledged_batch_id(&self) -> EngineResult<BatchId> {
        let queue = self.state.lock().mutation_queue.clone();
        Ok(self
            .persistence
            .run_transaction("get highest unacknowledged batch id", |txn| {
                queue.get_highest_unacknowledged_batch_id(txn)
            })?)
    }

    /// The first queued batch after `after_batch_id`.
    pub fn next_mutation_batch(&self, after_batch_id: BatchId) -> EngineResult<Option<MutationBatch>> {
        let queue = self.state.lock().mutation_queue.clone();
        Ok(self.persistence.run_transaction("get next mutation batch", |txn| {
            queue.get_next_mutation_batch_after_batch_id(txn, after_batch_id)
        })?)
    }

    /// The write stream token saved with the last acknowledgement.
    pub fn get_last_stream_token(&self) -> EngineResult<Bytes> {
        let queue = self.state.lock().mutation_queue.clone();
        Ok(self
            .persistence
            .run_transaction("get last stream token", |txn| queue.get_last_stream_token(txn))?)
    }

    /// Saves the write stream token.
    pub fn set_last_stream_token(&self, token: Bytes) -> EngineResult<()> {
        let queue = self.state.lock().mutation_queue.clone();
        Ok(self
            .persistence
            .run_transaction("set last stream token", |txn| queue.set_last_stream_token(txn, token))?)
    }

    /// The version of the last consistent watch snapshot.
    pub fn get_last_remote_snapshot_version(&self) -> EngineResult<SnapshotVersion> {
        let target_cache = self.persistence.target_cache();
        Ok(self
            .persistence
            .run_transaction("get last remote snapshot version", |txn| {
                target_cache.get_last_remote_snapshot_version(txn)
            })?)
    }

    /// Applies a consistent watch snapshot and returns the changed local view.
    ///
    /// Documents are only accepted if they are newer than the cached entry,
    /// or tie with an entry carrying committed mutations.
    pub fn apply_remote_event(&self, remote_event: &RemoteEvent) -> EngineResult<MaybeDocumentMap> {
        let mut state = self.state.lock();
        let target_cache = self.persistence.target_cache();
        let remote_documents = self.persistence.remote_document_cache();
        let delegate = self.persistence.reference_delegate();
        let remote_version = remote_event.snapshot_version;

        let (changes, new_target_data) = self.persistence.run_transaction("apply remote event", |txn| {
            let mut new_target_data = state.target_data_by_target.clone();
            for (target_id, change) in &remote_event.target_changes {
                // Targets released while the event was in flight are ignored.
                let Some(old_target_data) = state.target_data_by_target.get(target_id) else {
                    continue;
                };
                target_cache.remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                target_cache.add_matching_keys(txn, &change.added_documents, *target_id)?;

                let mut updated = old_target_data.with_sequence_number(txn.sequence_number());
                if remote_event.target_mismatches.contains(target_id) {
                    updated = updated
                        .with_resume_token(Bytes::new(), SnapshotVersion::MIN)
                        .with_last_limbo_free_snapshot_version(SnapshotVersion::MIN);
                } else if !change.resume_token.is_empty() {
                    updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                }

                if self.should_persist_target_data(old_target_data, &updated, change) {
                    target_cache.update_target_data(txn, &updated)?;
                }
                new_target_data.insert(*target_id, updated);
            }

            let mut buffer = remote_documents.clone().new_change_buffer();
            let update_keys: DocumentKeySet = remote_event.document_updates.keys().cloned().collect();
            let existing_docs = buffer.get_entries(txn, &update_keys)?;
            let mut changed_docs = NullableMaybeDocumentMap::new();

            for (key, doc) in remote_event.document_updates.iter() {
                if remote_event.resolved_limbo_documents.contains(key) {
                    delegate.update_limbo_document(txn, key)?;
                }
                let existing = existing_docs.get(key).cloned().flatten();

                if doc.is_no_document_at_min() {
                    // Known absent, time unknown: drop whatever the cache holds.
                    buffer.remove_entry(key);
                    changed_docs = changed_docs.insert(key.clone(), Some(doc.clone()));
                } else if accepts_update(existing.as_ref(), doc) {
                    buffer.add_entry(doc.clone(), remote_version);
                    changed_docs = changed_docs.insert(key.clone(), Some(doc.clone()));
                } else if let Some(existing) = existing {
                    debug!(
                        %key,
                        current = %existing.version(),
                        watch = %doc.version(),
                        "ignoring outdated watch update"
                    );
                }
            }

            if !remote_version.is_min() {
                let last_remote_version = target_cache.get_last_remote_snapshot_version(txn)?;
                assert!(
                    remote_version >= last_remote_version,
                    "watch stream reverted to a previous snapshot: {remote_version} < {last_remote_version}"
                );
                target_cache.set_target_and_sequence_metadata(txn, txn.sequence_number(), remote_version)?;
            }

            buffer.apply(txn)?;
            let changes = state.local_documents.get_local_view_of_documents(txn, &changed_docs)?;
            Ok((changes, new_target_data))
        })?;

        state.target_data_by_target = new_target_data;
        Ok(changes)
    }

    fn should_persist_target_data(&self, old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
        if new.resume_token.is_empty() {
            return old.resume_token != new.resume_token;
        }
        if old.resume_token.is_empty() {
            return true;
        }
        let max_age = i64::try_from(self.resume_token_max_age.as_micros()).unwrap_or(i64::MAX);
        if new.snapshot_version.to_micros() - old.snapshot_version.to_micros() >= max_age {
            return true;
        }
        change.document_change_count() > 0
    }

    /// Pins the keys views added, unpins the ones they removed, and advances
    /// the limbo-free version of targets with a synced view.
    pub fn notify_local_view_changes(&self, view_changes: &[LocalViewChanges]) -> EngineResult<()> {
        let mut state = self.state.lock();
        {
            let mut references = self.local_view_references.write();
            for changes in view_changes {
                references.add_references(&changes.added_keys, changes.target_id.0);
                references.remove_references(&changes.removed_keys, changes.target_id.0);
            }
        }

        let delegate = self.persistence.reference_delegate();
        self.persistence.run_transaction("notify local view changes", |txn| {
            for changes in view_changes {
                for key in changes.removed_keys.iter() {
                    delegate.remove_reference(txn, key)?;
                }
            }
            Ok(())
        })?;

        for changes in view_changes.iter().filter(|changes| !changes.from_cache) {
            if let Some(target_data) = state.target_data_by_target.get_mut(&changes.target_id) {
                *target_data = target_data.with_last_limbo_free_snapshot_version(target_data.snapshot_version);
            }
        }
        Ok(())
    }

    /// The local view of one document.
    pub fn read_document(&self, key: &DocumentKey) -> EngineResult<Option<MaybeDocument>> {
        let state = self.state.lock();
        Ok(self
            .persistence
            .run_transaction("read document", |txn| state.local_documents.get_document(txn, key))?)
    }

    /// Returns the target data for `target`, allocating a new target id if it
    /// has never been listened to.
    pub fn allocate_target(&self, target: Target) -> EngineResult<TargetData> {
        let mut state = self.state.lock();
        if let Some(cached) = state.cached_target_data(&target) {
            return Ok(cached.clone());
        }
        let target_cache = self.persistence.target_cache();
        let target_data = self.persistence.run_transaction("allocate target", |txn| {
            if let Some(persisted) = target_cache.get_target_data(txn, &target)? {
                return Ok(persisted);
            }
            let target_id = target_cache.allocate_target_id(txn)?;
            let target_data = TargetData::new(target.clone(), target_id, TargetPurpose::Listen, txn.sequence_number());
            target_cache.add_target_data(txn, &target_data)?;
            Ok(target_data)
        })?;

        debug!(target_id = %target_data.target_id, target = %target.canonical_id(), "allocated target");
        state
            .target_id_by_canonical_id
            .insert(target.canonical_id(), target_data.target_id);
        state
            .target_data_by_target
            .insert(target_data.target_id, target_data.clone());
        Ok(target_data)
    }

    /// The target data for `target`, if it is active or persisted.
    pub fn get_target_data(&self, target: &Target) -> EngineResult<Option<TargetData>> {
        let state = self.state.lock();
        if let Some(cached) = state.cached_target_data(target) {
            return Ok(Some(cached.clone()));
        }
        let target_cache = self.persistence.target_cache();
        Ok(self
            .persistence
            .run_transaction("get target data", |txn| target_cache.get_target_data(txn, target))?)
    }

    /// Stops tracking an active target.
    ///
    /// Unless `keep_persisted_target_data` is set, the target is removed from
    /// the target cache and its documents become eligible for collection.
    pub fn release_target(&self, target_id: TargetId, keep_persisted_target_data: bool) -> EngineResult<()> {
        let mut state = self.state.lock();
        let Some(target_data) = state.target_data_by_target.get(&target_id).cloned() else {
            return Err(StorageError::not_found(format!("released target {target_id} is not active")).into());
        };

        let removed = self.local_view_references.write().remove_references_for_id(target_id.0);
        let delegate = self.persistence.reference_delegate();
        self.persistence.run_transaction("release target", |txn| {
            for key in &removed {
                delegate.remove_reference(txn, key)?;
            }
            if !keep_persisted_target_data {
                delegate.remove_target(txn, &target_data)?;
            }
            Ok(())
        })?;

        state.target_data_by_target.remove(&target_id);
        let canonical_id = target_data.target.canonical_id();
        if state.target_id_by_canonical_id.get(&canonical_id) == Some(&target_id) {
            state.target_id_by_canonical_id.remove(&canonical_id);
        }
        debug!(%target_id, keep_persisted_target_data, "released target");
        Ok(())
    }

    /// Runs `query` against the local view.
    ///
    /// With `use_previous_results`, the last limbo-free result of the query's
    /// target seeds the index-free query engine.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> EngineResult<QueryResult> {
        let state = self.state.lock();
        let target = query.to_target();
        let target_cache = self.persistence.target_cache();
        let cached = state.cached_target_data(&target).cloned();

        Ok(self.persistence.run_transaction("execute query", |txn| {
            let target_data = match cached {
                Some(target_data) => Some(target_data),
                None => target_cache.get_target_data(txn, &target)?,
            };
            let (last_limbo_free, remote_keys) = match &target_data {
                Some(target_data) => (
                    target_data.last_limbo_free_snapshot_version,
                    target_cache.get_matching_keys_for_target_id(txn, target_data.target_id)?,
                ),
                None => (SnapshotVersion::MIN, DocumentKeySet::new()),
            };

            let documents = if use_previous_results {
                self.query_engine.get_documents_matching_query(
                    txn,
                    &state.local_documents,
                    query,
                    last_limbo_free,
                    &remote_keys,
                )?
            } else {
                self.query_engine.get_documents_matching_query(
                    txn,
                    &state.local_documents,
                    query,
                    SnapshotVersion::MIN,
                    &DocumentKeySet::new(),
                )?
            };
            Ok(QueryResult { documents, remote_keys })
        })?)
    }

    /// Keys the server last reported as matching `target_id`.
    pub fn get_remote_document_keys(&self, target_id: TargetId) -> EngineResult<DocumentKeySet> {
        let target_cache = self.persistence.target_cache();
        Ok(self
            .persistence
            .run_transaction("get remote document keys", |txn| {
                target_cache.get_matching_keys_for_target_id(txn, target_id)
            })?)
    }
}

fn accepts_update(existing: Option<&MaybeDocument>, doc: &MaybeDocument) -> bool {
    match existing {
        None => true,
        Some(existing) => {
            doc.version() > existing.version()
                || (doc.version() == existing.version() && existing.has_pending_writes())
        }
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalStore")
            .field("user", &state.user)
            .field("active_targets", &state.target_data_by_target.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::{
        Document, DocumentState, FieldPath, FieldTransform, FieldValue, MutationResult, NoDocument, ObjectValue,
        ResourcePath, TransformOperation,
    };
    use docsync_storage::MemoryPersistence;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(micros: i64) -> SnapshotVersion {
        SnapshotVersion::from_micros(micros)
    }

    fn doc(path: &str, v: i64, n: i32) -> MaybeDocument {
        Document::new(
            key(path),
            version(v),
            ObjectValue::from_fields([("n", FieldValue::from(n))]),
            DocumentState::Synced,
        )
        .into()
    }

    fn set(path: &str, n: i32) -> Mutation {
        Mutation::set(key(path), ObjectValue::from_fields([("n", FieldValue::from(n))]))
    }

    fn rooms() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap())
    }

    struct Harness {
        persistence: Arc<MemoryPersistence>,
        store: LocalStore,
    }

    impl Harness {
        fn new() -> Self {
            let persistence = Arc::new(MemoryPersistence::new());
            let store = LocalStore::new(persistence.clone(), &EngineConfig::default(), User::UNAUTHENTICATED);
            store.start().unwrap();
            Self { persistence, store }
        }

        fn listen(&self, query: &Query) -> TargetData {
            self.store.allocate_target(query.to_target()).unwrap()
        }

        fn event(&self, target_id: TargetId, v: i64, docs: Vec<MaybeDocument>, token: &'static [u8]) -> RemoteEvent {
            let added: DocumentKeySet = docs.iter().map(|d| d.key().clone()).collect();
            let mut event = RemoteEvent {
                snapshot_version: version(v),
                ..RemoteEvent::default()
            };
            event.target_changes.insert(
                target_id,
                TargetChange {
                    resume_token: Bytes::from_static(token),
                    current: true,
                    added_documents: added,
                    ..TargetChange::default()
                },
            );
            for doc in docs {
                event.document_updates = event.document_updates.insert(doc.key().clone(), doc);
            }
            event
        }

        fn n(&self, path: &str) -> Option<FieldValue> {
            let doc = self.store.read_document(&key(path)).unwrap()?;
            doc.as_document()?.field(&FieldPath::new(["n"])).cloned()
        }
    }

    #[test]
    fn local_writes_are_visible_and_pending() {
        let h = Harness::new();
        let result = h.store.local_write(vec![set("rooms/a", 1)]).unwrap();
        assert_eq!(result.batch_id, BatchId(1));
        let changed = result.changes.get(&key("rooms/a")).unwrap();
        assert!(changed.has_pending_writes());
        assert_eq!(h.n("rooms/a"), Some(FieldValue::from(1)));
        assert_eq!(h.store.get_highest_unacknowledged_batch_id().unwrap(), BatchId(1));
    }

    #[test]
    fn transforms_capture_base_values() {
        let h = Harness::new();
        let target = h.listen(&rooms());
        h.store
            .apply_remote_event(&h.event(target.target_id, 1, vec![doc("rooms/a", 1, 5)], b"t"))
            .unwrap();

        let increment = Mutation::transform(
            key("rooms/a"),
            vec![FieldTransform::new(
                FieldPath::new(["n"]),
                TransformOperation::NumericIncrement(FieldValue::from(1)),
            )],
        );
        let result = h.store.local_write(vec![increment]).unwrap();
        let batch = h.store.next_mutation_batch(BatchId::UNKNOWN).unwrap().unwrap();
        assert_eq!(batch.batch_id, result.batch_id);
        assert_eq!(batch.base_mutations.len(), 1);
        assert_eq!(h.n("rooms/a"), Some(FieldValue::from(6)));
    }

    #[test]
    fn acknowledged_writes_land_in_the_remote_cache() {
        let h = Harness::new();
        let result = h.store.local_write(vec![set("rooms/a", 1)]).unwrap();
        let batch = h.store.next_mutation_batch(BatchId::UNKNOWN).unwrap().unwrap();
        let ack = MutationBatchResult::from(
            batch,
            version(3),
            vec![MutationResult::new(version(3), None)],
            Bytes::from_static(b"stream"),
        );

        let changes = h.store.acknowledge_batch(&ack).unwrap();
        let acked = changes.get(&key("rooms/a")).unwrap();
        assert!(acked.has_committed_mutations());
        assert_eq!(acked.version(), version(3));
        assert_eq!(h.store.get_last_stream_token().unwrap(), Bytes::from_static(b"stream"));
        assert_eq!(h.store.get_highest_unacknowledged_batch_id().unwrap(), BatchId::UNKNOWN);
        assert!(h.store.lookup_mutation_documents(result.batch_id).unwrap().is_none());
    }

    #[test]
    fn rejected_writes_revert_the_local_view() {
        let h = Harness::new();
        let result = h.store.local_write(vec![set("rooms/a", 1)]).unwrap();
        let changes = h.store.reject_batch(result.batch_id).unwrap();
        assert!(changes.get(&key("rooms/a")).unwrap().is_no_document_at_min());
        assert_eq!(h.n("rooms/a"), None);
        assert!(h.store.reject_batch(result.batch_id).is_err());
    }

    #[test]
    fn remote_events_only_accept_newer_versions() {
        let h = Harness::new();
        let target = h.listen(&rooms());
        h.store
            .apply_remote_event(&h.event(target.target_id, 5, vec![doc("rooms/a", 5, 1)], b"t1"))
            .unwrap();
        let changes = h
            .store
            .apply_remote_event(&h.event(target.target_id, 6, vec![doc("rooms/a", 4, 2)], b"t2"))
            .unwrap();

        assert!(changes.is_empty());
        assert_eq!(h.n("rooms/a"), Some(FieldValue::from(1)));
        assert_eq!(h.store.get_last_remote_snapshot_version().unwrap(), version(6));
        assert_eq!(
            h.store.get_remote_document_keys(target.target_id).unwrap(),
            DocumentKeySet::new().insert(key("rooms/a"))
        );
    }

    #[test]
    fn equal_versions_replace_committed_but_unsynced_entries() {
        let h = Harness::new();
        let target = h.listen(&rooms());
        h.store.local_write(vec![set("rooms/a", 1)]).unwrap();
        let batch = h.store.next_mutation_batch(BatchId::UNKNOWN).unwrap().unwrap();
        let ack = MutationBatchResult::from(batch, version(3), vec![MutationResult::new(version(3), None)], Bytes::new());
        h.store.acknowledge_batch(&ack).unwrap();

        let changes = h
            .store
            .apply_remote_event(&h.event(target.target_id, 3, vec![doc("rooms/a", 3, 1)], b"t"))
            .unwrap();
        assert!(!changes.get(&key("rooms/a")).unwrap().has_pending_writes());
    }

    #[test]
    fn unknown_time_deletes_clear_the_cache() {
        let h = Harness::new();
        let target = h.listen(&rooms());
        h.store
            .apply_remote_event(&h.event(target.target_id, 5, vec![doc("rooms/a", 5, 1)], b"t1"))
            .unwrap();

        let mut event = RemoteEvent::default();
        let deleted: MaybeDocument = NoDocument::new(key("rooms/a"), SnapshotVersion::MIN, false).into();
        event.document_updates = event.document_updates.insert(key("rooms/a"), deleted);
        let changes = h.store.apply_remote_event(&event).unwrap();

        assert!(changes.get(&key("rooms/a")).unwrap().is_no_document_at_min());
        assert!(h.persistence.memory_remote_documents().is_empty());
        assert_eq!(h.store.get_last_remote_snapshot_version().unwrap(), version(5));
    }

    #[test]
    #[should_panic(expected = "reverted")]
    fn remote_snapshot_versions_never_go_backwards() {
        let h = Harness::new();
        let target = h.listen(&rooms());
        h.store.apply_remote_event(&h.event(target.target_id, 5, vec![], b"t1")).unwrap();
        h.store.apply_remote_event(&h.event(target.target_id, 4, vec![], b"t2")).unwrap();
    }

    #[test]
    fn resume_tokens_advance_and_mismatches_reset_them() {
        let h = Harness::new();
        let query = rooms();
        let target = h.listen(&query);
        h.store.apply_remote_event(&h.event(target.target_id, 5, vec![], b"t1")).unwrap();
        let data = h.store.get_target_data(&query.to_target()).unwrap().unwrap();
        assert_eq!(data.resume_token, Bytes::from_static(b"t1"));
        assert_eq!(data.snapshot_version, version(5));

        let mut mismatch = h.event(target.target_id, 6, vec![], b"");
        mismatch.target_mismatches.insert(target.target_id);
        h.store.apply_remote_event(&mismatch).unwrap();
        let data = h.store.get_target_data(&query.to_target()).unwrap().unwrap();
        assert!(data.resume_token.is_empty());
        assert!(data.last_limbo_free_snapshot_version.is_min());
    }

    #[test]
    fn token_only_changes_are_not_persisted_until_stale() {
        let h = Harness::new();
        let target = h.listen(&rooms());
        h.store.apply_remote_event(&h.event(target.target_id, 5, vec![], b"t1")).unwrap();
        h.store.apply_remote_event(&h.event(target.target_id, 6, vec![], b"t2")).unwrap();

        let persisted = h
            .persistence
            .run_transaction("read", |txn| {
                h.persistence.target_cache().get_target_data(txn, &rooms().to_target())
            })
            .unwrap()
            .unwrap();
        assert_eq!(persisted.resume_token, Bytes::from_static(b"t1"));
    }

    #[test]
    fn allocating_the_same_target_twice_reuses_its_id() {
        let h = Harness::new();
        let first = h.listen(&rooms());
        let second = h.listen(&rooms());
        assert_eq!(first.target_id, second.target_id);
        assert_eq!(first.target_id, TargetId(2));

        let other = h.listen(&Query::at_path(ResourcePath::from_string("users").unwrap()));
        assert_eq!(other.target_id, TargetId(4));
    }

    #[test]
    fn releasing_a_target_collects_its_documents() {
        let h = Harness::new();
        let target = h.listen(&rooms());
        h.store
            .apply_remote_event(&h.event(target.target_id, 5, vec![doc("rooms/a", 5, 1)], b"t1"))
            .unwrap();
        assert_eq!(h.persistence.memory_remote_documents().len(), 1);

        h.store.release_target(target.target_id, false).unwrap();
        assert!(h.persistence.memory_remote_documents().is_empty());
        assert!(h.store.release_target(target.target_id, false).is_err());
    }

    #[test]
    fn view_pins_keep_documents_alive_and_advance_limbo_free_versions() {
        let h = Harness::new();
        let query = rooms();
        let target = h.listen(&query);
        h.store
            .apply_remote_event(&h.event(target.target_id, 5, vec![doc("rooms/a", 5, 1)], b"t1"))
            .unwrap();
        h.store
            .notify_local_view_changes(&[LocalViewChanges {
                target_id: target.target_id,
                from_cache: false,
                added_keys: DocumentKeySet::new().insert(key("rooms/a")),
                removed_keys: DocumentKeySet::new(),
            }])
            .unwrap();

        let data = h.store.get_target_data(&query.to_target()).unwrap().unwrap();
        assert_eq!(data.last_limbo_free_snapshot_version, version(5));

        let result = h.store.execute_query(&query, true).unwrap();
        assert_eq!(result.documents.len(), 1);
        assert_eq!(result.remote_keys.len(), 1);
    }

    #[test]
    fn queries_see_local_writes_without_a_target() {
        let h = Harness::new();
        h.store.local_write(vec![set("rooms/a", 1), set("rooms/b", 2)]).unwrap();
        let result = h.store.execute_query(&rooms(), false).unwrap();
        assert_eq!(result.documents.len(), 2);
        assert!(result.remote_keys.is_empty());
    }

    #[test]
    fn user_changes_swap_mutation_queues() {
        let h = Harness::new();
        h.store.local_write(vec![set("rooms/a", 1)]).unwrap();

        let change = h.store.handle_user_change(User::new("alice")).unwrap();
        assert_eq!(change.removed_batch_ids, vec![BatchId(1)]);
        assert!(change.added_batch_ids.is_empty());
        assert!(change.affected_documents.get(&key("rooms/a")).unwrap().is_no_document_at_min());
        assert_eq!(h.store.current_user(), User::new("alice"));

        let back = h.store.handle_user_change(User::UNAUTHENTICATED).unwrap();
        assert_eq!(back.added_batch_ids, vec![BatchId(1)]);
        assert_eq!(h.n("rooms/a"), Some(FieldValue::from(1)));
    }

    #[test]
    fn persistence_failures_propagate() {
        let h = Harness::new();
        h.persistence.set_available(false);
        let err = h.store.local_write(vec![set("rooms/a", 1)]).unwrap_err();
        assert!(err.is_persistence_failure());
        h.persistence.set_available(true);
        h.store.local_write(vec![set("rooms/a", 1)]).unwrap();
    }
}
