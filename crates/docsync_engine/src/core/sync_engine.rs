//! The sync coordinator.
//!
//! [`SyncEngine`] is the synchronous core of a client. It owns the delayed
//! operation queue, the [`RemoteStore`] and a [`SyncCore`] that keeps one
//! [`View`] per active query. Every public method runs one operation to
//! completion: it updates local state, hands the resulting network requests
//! to the remote store and leaves snapshots in an event buffer that callers
//! drain with [`SyncEngine::drain_events`].
//!
//! ## Key Invariants
//!
//! - Queries that map to the same target share one target id and one listen
//! - At most `max_concurrent_limbo_resolutions` limbo targets are active
//! - Write callbacks resolve before the snapshots reflecting the write are
//!   raised
//! - Only the primary client opens network streams

use crate::config::EngineConfig;
use crate::core::shared_client_state::{MutationBatchState, QueryTargetState, SharedClientState};
use crate::core::view::{LimboDocumentChange, View};
use crate::core::view_snapshot::ViewSnapshot;
use crate::error::{EngineError, EngineResult};
use crate::local::{LocalStore, LocalViewChanges, QueryResult};
use crate::queue::{AsyncQueue, TimerId};
use crate::remote::{
    Connection, CredentialsProvider, OnlineState, RemoteEvent, RemoteStore, RemoteSyncer, StreamEvent,
    StreamEventSender, TargetChange,
};
use docsync_model::{
    BatchId, DocumentKey, DocumentKeySet, ListenSequenceNumber, MaybeDocument, MaybeDocumentMap, Mutation,
    MutationBatchResult, NoDocument, Query, SnapshotVersion, Target, TargetData, TargetId, TargetIdGenerator,
    TargetPurpose, User,
};
use docsync_protocol::Code;
use docsync_storage::{Persistence, ReferenceSet};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Completion handle for a write or a pending-writes wait.
pub type WriteCallback = oneshot::Sender<EngineResult<()>>;

/// Output of the sync engine, consumed by the event manager.
#[derive(Debug, Clone)]
pub enum SyncEngineEvent {
    /// New snapshots for one or more queries, raised together.
    Snapshots(Vec<ViewSnapshot>),
    /// The backend rejected a query's listen.
    WatchError {
        /// The affected query.
        query: Query,
        /// Why the listen failed.
        error: EngineError,
    },
    /// The client's online state changed.
    OnlineStateChanged(OnlineState),
}

/// Network work requested by the core, carried out by the remote store once
/// the current operation finishes.
#[derive(Debug, Clone)]
enum RemoteCommand {
    Listen(TargetData),
    Unlisten(TargetId),
    FillWritePipeline,
    ApplyPrimaryState(bool),
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

/// A single-document listen resolving a limbo document.
#[derive(Debug, Clone)]
struct LimboResolution {
    key: DocumentKey,
    /// Set once the target reported the document, so later changes are
    /// known to be modifications or removals.
    received_document: bool,
}

impl LimboResolution {
    fn new(key: DocumentKey) -> Self {
        Self {
            key,
            received_document: false,
        }
    }
}

/// Query views, limbo tracking and write callbacks.
///
/// The core never touches the network. It records [`RemoteCommand`]s that
/// [`SyncEngine`] forwards to the remote store, and it implements
/// [`RemoteSyncer`] so the remote store can hand results back.
pub struct SyncCore {
    local_store: Arc<LocalStore>,
    shared_client_state: Arc<dyn SharedClientState>,
    max_concurrent_limbo_resolutions: usize,
    query_views_by_query: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Limbo keys referenced by each view's target.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    mutation_user_callbacks: HashMap<User, BTreeMap<BatchId, WriteCallback>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
    current_user: User,
    is_primary: bool,
    online_state: OnlineState,
    commands: VecDeque<RemoteCommand>,
    events: Vec<SyncEngineEvent>,
}

impl SyncCore {
    fn new(
        local_store: Arc<LocalStore>,
        shared_client_state: Arc<dyn SharedClientState>,
        config: &EngineConfig,
        user: User,
    ) -> Self {
        Self {
            local_store,
            shared_client_state,
            max_concurrent_limbo_resolutions: config.max_concurrent_limbo_resolutions,
            query_views_by_query: BTreeMap::new(),
            queries_by_target: BTreeMap::new(),
            enqueued_limbo_resolutions: VecDeque::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: ReferenceSet::new(),
            limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
            mutation_user_callbacks: HashMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            current_user: user,
            is_primary: false,
            online_state: OnlineState::Unknown,
            commands: VecDeque::new(),
            events: Vec::new(),
        }
    }

    /// Registers a view for `query` and returns its initial snapshot.
    fn listen(&mut self, query: Query) -> EngineResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        if let Some(query_view) = self.query_views_by_query.get(&canonical_id) {
            self.shared_client_state.add_local_query_target(query_view.target_id);
            return Ok(query_view.view.compute_initial_snapshot());
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        let status = self.shared_client_state.add_local_query_target(target_id);
        let target_is_new = !self.queries_by_target.contains_key(&target_id);
        debug!(%target_id, query = %canonical_id, "listening to query");

        let snapshot =
            self.initialize_view_and_compute_snapshot(query, target_id, status == QueryTargetState::Current)?;
        if self.is_primary && target_is_new {
            self.commands.push_back(RemoteCommand::Listen(target_data));
        }
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &mut self,
        query: Query,
        target_id: TargetId,
        current: bool,
    ) -> EngineResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys.clone());
        let changes = view.compute_doc_changes(&documents_of(&query_result), None);
        let current = current && self.online_state != OnlineState::Offline;
        let synthesized = TargetChange::synthesized_current_change(current);
        let view_change = view.apply_changes(changes, self.is_primary, Some(&synthesized));
        self.update_tracked_limbos(target_id, view_change.limbo_changes);

        let Some(snapshot) = view_change.snapshot else {
            panic!("the first view change of {query} produced no snapshot");
        };
        self.queries_by_target.entry(target_id).or_default().push(query.clone());
        self.query_views_by_query.insert(
            query.canonical_id(),
            QueryView {
                query,
                target_id,
                view,
            },
        );
        Ok(snapshot)
    }

    /// Drops the view for `query`, releasing its target when no other query
    /// shares it.
    ///
    /// # Panics
    ///
    /// Panics if `query` has no view.
    fn unlisten(&mut self, query: &Query) -> EngineResult<()> {
        let canonical_id = query.canonical_id();
        let Some(query_view) = self.query_views_by_query.remove(&canonical_id) else {
            panic!("unlisten called for a query that is not listened to: {query}");
        };
        let target_id = query_view.target_id;
        if let Some(queries) = self.queries_by_target.get_mut(&target_id) {
            queries.retain(|other| other.canonical_id() != canonical_id);
            if !queries.is_empty() {
                debug!(%target_id, "target still used by another query");
                return Ok(());
            }
        }

        if self.is_primary {
            self.shared_client_state.remove_local_query_target(target_id);
            if !self.shared_client_state.is_active_query_target(target_id) {
                self.local_store.release_target(target_id, false)?;
                self.shared_client_state.clear_query_state(target_id);
                self.commands.push_back(RemoteCommand::Unlisten(target_id));
                self.remove_and_cleanup_target(target_id, None);
            }
        } else {
            self.remove_and_cleanup_target(target_id, None);
            self.local_store.release_target(target_id, true)?;
        }
        Ok(())
    }

    /// Writes `mutations` locally and queues them for the backend. A failed
    /// local write is reported through `callback`.
    fn write(&mut self, mutations: Vec<Mutation>, callback: WriteCallback) -> EngineResult<()> {
        let result = match self.local_store.local_write(mutations) {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "failed to persist write");
                let _ = callback.send(Err(err));
                return Ok(());
            }
        };
        self.shared_client_state.add_pending_mutation(result.batch_id);
        self.mutation_user_callbacks
            .entry(self.current_user.clone())
            .or_default()
            .insert(result.batch_id, callback);
        self.emit_new_snaps_and_notify_local_store(&result.changes, None)?;
        self.commands.push_back(RemoteCommand::FillWritePipeline);
        Ok(())
    }

    /// Resolves `callback` once every batch written so far is acknowledged
    /// or rejected.
    fn register_pending_writes_callback(&mut self, callback: WriteCallback) -> EngineResult<()> {
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id()?;
        if highest_batch_id == BatchId::UNKNOWN {
            let _ = callback.send(Ok(()));
            return Ok(());
        }
        self.pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(callback);
        Ok(())
    }

    fn trigger_pending_writes_callbacks(&mut self, batch_id: BatchId) {
        if let Some(callbacks) = self.pending_writes_callbacks.remove(&batch_id) {
            for callback in callbacks {
                let _ = callback.send(Ok(()));
            }
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&mut self, message: &str) {
        for callback in std::mem::take(&mut self.pending_writes_callbacks).into_values().flatten() {
            let _ = callback.send(Err(EngineError::rpc(Code::Cancelled, message)));
        }
    }

    fn process_user_callback(&mut self, batch_id: BatchId, result: EngineResult<()>) {
        let callback = self
            .mutation_user_callbacks
            .get_mut(&self.current_user)
            .and_then(|callbacks| callbacks.remove(&batch_id));
        if let Some(callback) = callback {
            let _ = callback.send(result);
        }
    }

    /// Swaps the mutation queue when the user changed. Returns true if it
    /// did.
    fn handle_credential_change(&mut self, user: User) -> EngineResult<bool> {
        if user == self.current_user {
            return Ok(false);
        }
        info!(from = %self.current_user, to = %user, "user changed");
        let result = self.local_store.handle_user_change(user.clone())?;
        self.current_user = user;
        self.reject_outstanding_pending_writes_callbacks("pending writes wait cancelled by a user change");
        self.shared_client_state.handle_user_change(
            &self.current_user,
            &result.removed_batch_ids,
            &result.added_batch_ids,
        );
        self.emit_new_snaps_and_notify_local_store(&result.affected_documents, None)?;
        Ok(true)
    }

    fn apply_primary_state(&mut self, is_primary: bool) -> EngineResult<()> {
        if is_primary && !self.is_primary {
            debug!("becoming primary");
            self.is_primary = true;
            let targets: Vec<TargetId> = self.queries_by_target.keys().copied().collect();
            let active_targets = self.synchronize_query_views_and_raise_snapshots(&targets)?;
            self.commands.push_back(RemoteCommand::ApplyPrimaryState(true));
            for target_data in active_targets {
                self.commands.push_back(RemoteCommand::Listen(target_data));
            }
        } else if !is_primary && self.is_primary {
            debug!("becoming secondary");
            let targets: Vec<TargetId> = self.queries_by_target.keys().copied().collect();
            for &target_id in &targets {
                self.commands.push_back(RemoteCommand::Unlisten(target_id));
            }
            self.is_primary = false;
            self.synchronize_query_views_and_raise_snapshots(&targets)?;
            self.reset_limbo_documents();
            self.commands.push_back(RemoteCommand::ApplyPrimaryState(false));
        }
        Ok(())
    }

    /// Rebuilds the views of `targets` from persistence and raises the
    /// resulting snapshots. Returns the targets' metadata.
    fn synchronize_query_views_and_raise_snapshots(&mut self, targets: &[TargetId]) -> EngineResult<Vec<TargetData>> {
        let mut snapshots = Vec::new();
        let mut active_targets = Vec::new();
        for &target_id in targets {
            let Some(queries) = self.queries_by_target.get(&target_id).cloned() else {
                continue;
            };
            let Some(first) = queries.first() else {
                continue;
            };
            active_targets.push(self.local_store.allocate_target(first.to_target())?);
            for query in &queries {
                let query_result = self.local_store.execute_query(query, true)?;
                let Some(query_view) = self.query_views_by_query.get_mut(&query.canonical_id()) else {
                    continue;
                };
                let view_change = query_view.view.synchronize_with_persisted_state(query_result);
                if self.is_primary {
                    self.update_tracked_limbos(target_id, view_change.limbo_changes);
                }
                snapshots.extend(view_change.snapshot);
            }
        }
        if !snapshots.is_empty() {
            self.events.push(SyncEngineEvent::Snapshots(snapshots));
        }
        Ok(active_targets)
    }

    fn reset_limbo_documents(&mut self) {
        for &target_id in self.active_limbo_resolutions_by_target.keys() {
            self.commands.push_back(RemoteCommand::Unlisten(target_id));
        }
        self.limbo_document_refs.remove_all_references();
        self.active_limbo_resolutions_by_target.clear();
        self.active_limbo_targets_by_key.clear();
        self.enqueued_limbo_resolutions.clear();
    }

    /// Applies a batch state published by the primary client.
    fn apply_batch_state(
        &mut self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<EngineError>,
    ) -> EngineResult<()> {
        let Some(documents) = self.local_store.lookup_mutation_documents(batch_id)? else {
            debug!(%batch_id, "cannot apply state of an unknown batch");
            return Ok(());
        };
        match state {
            MutationBatchState::Pending => self.commands.push_back(RemoteCommand::FillWritePipeline),
            MutationBatchState::Acknowledged => self.process_user_callback(batch_id, Ok(())),
            MutationBatchState::Rejected => {
                let error = error.unwrap_or_else(|| EngineError::rpc(Code::Unknown, "write rejected"));
                self.process_user_callback(batch_id, Err(error));
            }
        }
        self.emit_new_snaps_and_notify_local_store(&documents, None)
    }

    /// Applies a target state published by the primary client.
    fn apply_target_state(
        &mut self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<EngineError>,
    ) -> EngineResult<()> {
        if self.is_primary {
            debug!(%target_id, "primary ignores target state notifications");
            return Ok(());
        }
        let Some(queries) = self.queries_by_target.get(&target_id).cloned() else {
            return Ok(());
        };
        match state {
            QueryTargetState::Current | QueryTargetState::NotCurrent => {
                let mut changes = MaybeDocumentMap::new();
                for query in &queries {
                    let query_result = self.local_store.execute_query(query, false)?;
                    for (key, doc) in documents_of(&query_result).iter() {
                        changes = changes.insert(key.clone(), doc.clone());
                    }
                }
                let event = RemoteEvent::synthesized_current_change(target_id, state == QueryTargetState::Current);
                self.emit_new_snaps_and_notify_local_store(&changes, Some(&event))
            }
            QueryTargetState::Rejected => {
                self.local_store.release_target(target_id, true)?;
                let error = error.unwrap_or_else(|| EngineError::rpc(Code::Unknown, "listen rejected"));
                self.remove_and_cleanup_target(target_id, Some(error));
                Ok(())
            }
        }
    }

    fn remove_and_cleanup_target(&mut self, target_id: TargetId, error: Option<EngineError>) {
        self.shared_client_state.remove_local_query_target(target_id);
        for query in self.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.query_views_by_query.remove(&query.canonical_id());
            if let Some(error) = &error {
                self.events.push(SyncEngineEvent::WatchError {
                    query,
                    error: error.clone(),
                });
            }
        }

        for key in self.limbo_document_refs.remove_references_for_id(target_id.0) {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key);
            }
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey) {
        self.enqueued_limbo_resolutions.retain(|enqueued| enqueued != key);
        if let Some(limbo_target_id) = self.active_limbo_targets_by_key.remove(key) {
            trace!(%key, target_id = %limbo_target_id, "stopping limbo resolution");
            self.commands.push_back(RemoteCommand::Unlisten(limbo_target_id));
            self.active_limbo_resolutions_by_target.remove(&limbo_target_id);
            self.pump_enqueued_limbo_resolutions();
        }
    }

    fn update_tracked_limbos(&mut self, target_id: TargetId, limbo_changes: Vec<LimboDocumentChange>) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs.add_reference(key.clone(), target_id.0);
                    self.track_limbo_change(key);
                }
                LimboDocumentChange::Removed(key) => {
                    trace!(%key, "document left limbo");
                    self.limbo_document_refs.remove_reference(key.clone(), target_id.0);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey) {
        if self.active_limbo_targets_by_key.contains_key(&key) || self.enqueued_limbo_resolutions.contains(&key) {
            return;
        }
        trace!(%key, "new document in limbo");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions();
    }

    /// Starts limbo listens for queued keys while below the concurrency cap.
    fn pump_enqueued_limbo_resolutions(&mut self) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = self.limbo_target_id_generator.next_id();
            debug!(%key, target_id = %limbo_target_id, "resolving limbo document");
            self.active_limbo_resolutions_by_target
                .insert(limbo_target_id, LimboResolution::new(key.clone()));
            self.active_limbo_targets_by_key.insert(key.clone(), limbo_target_id);
            self.commands.push_back(RemoteCommand::Listen(TargetData::new(
                Target::for_document(&key),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                ListenSequenceNumber::INVALID,
            )));
        }
    }

    /// Feeds `changes` through every view, refilling limit queries from the
    /// local store, and raises the resulting snapshots.
    fn emit_new_snaps_and_notify_local_store(
        &mut self,
        changes: &MaybeDocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> EngineResult<()> {
        let is_primary = self.is_primary;
        let mut new_snapshots = Vec::new();
        let mut local_view_changes = Vec::new();
        let mut limbo_updates = Vec::new();

        for query_view in self.query_views_by_query.values_mut() {
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
            if doc_changes.needs_refill {
                // A document left the limit window; the replacement may be
                // one the change set never mentioned.
                let query_result = self.local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&documents_of(&query_result), Some(doc_changes));
            }
            let target_change = remote_event.and_then(|event| event.target_changes.get(&query_view.target_id));
            let view_change = query_view.view.apply_changes(doc_changes, is_primary, target_change);
            limbo_updates.push((query_view.target_id, view_change.limbo_changes));

            if let Some(snapshot) = view_change.snapshot {
                if is_primary {
                    let state = if snapshot.from_cache {
                        QueryTargetState::NotCurrent
                    } else {
                        QueryTargetState::Current
                    };
                    self.shared_client_state
                        .update_query_state(query_view.target_id, state, None);
                }
                local_view_changes.push(LocalViewChanges::from_snapshot(query_view.target_id, &snapshot));
                new_snapshots.push(snapshot);
            }
        }

        for (target_id, limbo_changes) in limbo_updates {
            self.update_tracked_limbos(target_id, limbo_changes);
        }
        if !new_snapshots.is_empty() {
            self.events.push(SyncEngineEvent::Snapshots(new_snapshots));
        }
        self.local_store.notify_local_view_changes(&local_view_changes)
    }
}

impl RemoteSyncer for SyncCore {
    fn apply_remote_event(&mut self, event: RemoteEvent) -> EngineResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            assert!(
                change.document_change_count() <= 1,
                "limbo resolution {target_id} received more than one document"
            );
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                assert!(
                    resolution.received_document,
                    "limbo target {target_id} modified a document it never added"
                );
            } else if !change.removed_documents.is_empty() {
                assert!(
                    resolution.received_document,
                    "limbo target {target_id} removed a document it never added"
                );
                resolution.received_document = false;
            }
        }

        let changes = self.local_store.apply_remote_event(&event)?;
        self.emit_new_snaps_and_notify_local_store(&changes, Some(&event))
    }

    fn reject_listen(&mut self, target_id: TargetId, error: EngineError) -> EngineResult<()> {
        let limbo_key = self
            .active_limbo_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());

        if let Some(key) = limbo_key {
            // The document cannot be read, so treat it as deleted at an
            // unknown time.
            debug!(%key, %error, "limbo resolution rejected");
            let deleted = MaybeDocument::from(NoDocument::new(key.clone(), SnapshotVersion::MIN, false));
            let event = RemoteEvent {
                document_updates: MaybeDocumentMap::new().insert(key.clone(), deleted),
                resolved_limbo_documents: DocumentKeySet::new().insert(key.clone()),
                ..RemoteEvent::default()
            };
            self.apply_remote_event(event)?;

            self.active_limbo_targets_by_key.remove(&key);
            self.active_limbo_resolutions_by_target.remove(&target_id);
            self.pump_enqueued_limbo_resolutions();
            Ok(())
        } else {
            warn!(%target_id, %error, "listen rejected");
            self.local_store.release_target(target_id, false)?;
            self.shared_client_state
                .update_query_state(target_id, QueryTargetState::Rejected, Some(&error));
            self.remove_and_cleanup_target(target_id, Some(error));
            Ok(())
        }
    }

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> EngineResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(&result)?;
        self.process_user_callback(batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Acknowledged, None);
        self.emit_new_snaps_and_notify_local_store(&changes, None)
    }

    fn reject_failed_write(&mut self, batch_id: BatchId, error: EngineError) -> EngineResult<()> {
        let changes = self.local_store.reject_batch(batch_id)?;
        self.process_user_callback(batch_id, Err(error.clone()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Rejected, Some(&error));
        self.emit_new_snaps_and_notify_local_store(&changes, None)
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return DocumentKeySet::new().insert(resolution.key.clone());
            }
            return DocumentKeySet::new();
        }
        let mut keys = DocumentKeySet::new();
        for query in self.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = self.query_views_by_query.get(&query.canonical_id()) {
                keys = keys.union(query_view.view.synced_documents());
            }
        }
        keys
    }

    fn handle_online_state_change(&mut self, state: OnlineState) {
        debug!(%state, "online state changed");
        self.online_state = state;
        let mut snapshots = Vec::new();
        for query_view in self.query_views_by_query.values_mut() {
            let view_change = query_view.view.apply_online_state_change(state);
            assert!(
                view_change.limbo_changes.is_empty(),
                "online state changes must not affect limbo documents"
            );
            snapshots.extend(view_change.snapshot);
        }
        if !snapshots.is_empty() {
            self.events.push(SyncEngineEvent::Snapshots(snapshots));
        }
        self.events.push(SyncEngineEvent::OnlineStateChanged(state));
        self.shared_client_state.set_online_state(state);
    }
}

impl std::fmt::Debug for SyncCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCore")
            .field("user", &self.current_user)
            .field("is_primary", &self.is_primary)
            .field("queries", &self.query_views_by_query.len())
            .field("active_limbo_resolutions", &self.active_limbo_targets_by_key.len())
            .field("enqueued_limbo_resolutions", &self.enqueued_limbo_resolutions.len())
            .finish_non_exhaustive()
    }
}

fn documents_of(query_result: &QueryResult) -> MaybeDocumentMap {
    query_result
        .documents
        .iter()
        .map(|(key, doc)| (key.clone(), MaybeDocument::Document(doc.clone())))
        .collect()
}

/// The synchronous client core.
///
/// Transport events arrive through the [`StreamEventSender`] given to
/// [`SyncEngine::new`]; the owner feeds them back with
/// [`SyncEngine::handle_stream_event`]. Time only moves when the owner calls
/// [`SyncEngine::advance_to`] or [`SyncEngine::run_delayed_operations_until`].
pub struct SyncEngine {
    queue: AsyncQueue,
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    core: SyncCore,
    shut_down: bool,
}

impl SyncEngine {
    /// Wires a client over `persistence` and `connection`. Nothing runs
    /// until [`SyncEngine::start`].
    pub fn new(
        persistence: Arc<dyn Persistence>,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        shared_client_state: Arc<dyn SharedClientState>,
        config: &EngineConfig,
        user: User,
        events: StreamEventSender,
    ) -> Self {
        let local_store = Arc::new(LocalStore::new(persistence, config, user.clone()));
        let remote_store = RemoteStore::new(Arc::clone(&local_store), connection, credentials, events, config);
        let core = SyncCore::new(Arc::clone(&local_store), shared_client_state, config, user);
        Self {
            queue: AsyncQueue::new(),
            local_store,
            remote_store,
            core,
            shut_down: false,
        }
    }

    /// Starts persistence and the network as the primary client.
    ///
    /// A secondary client calls [`SyncEngine::apply_primary_state`] with
    /// `false` afterwards.
    pub fn start(&mut self) -> EngineResult<()> {
        self.ensure_running()?;
        self.local_store.start()?;
        self.remote_store.start(&mut self.queue, &mut self.core)?;
        self.core.apply_primary_state(true)?;
        self.drain_commands()
    }

    /// Listens to `query` and returns its initial snapshot. Later snapshots
    /// arrive through [`SyncEngine::drain_events`].
    pub fn listen(&mut self, query: Query) -> EngineResult<ViewSnapshot> {
        self.ensure_running()?;
        let snapshot = self.core.listen(query)?;
        self.drain_commands()?;
        Ok(snapshot)
    }

    /// Stops listening to `query`.
    pub fn unlisten(&mut self, query: &Query) -> EngineResult<()> {
        self.ensure_running()?;
        self.core.unlisten(query)?;
        self.drain_commands()
    }

    /// Writes a batch locally and sends it once the network allows. The
    /// receiver resolves when the backend accepts or rejects the batch.
    pub fn write(&mut self, mutations: Vec<Mutation>) -> EngineResult<oneshot::Receiver<EngineResult<()>>> {
        self.ensure_running()?;
        let (callback, receiver) = oneshot::channel();
        self.core.write(mutations, callback)?;
        self.drain_commands()?;
        Ok(receiver)
    }

    /// The receiver resolves once every batch written so far has been
    /// acknowledged or rejected.
    pub fn wait_for_pending_writes(&mut self) -> EngineResult<oneshot::Receiver<EngineResult<()>>> {
        self.ensure_running()?;
        if !self.remote_store.can_use_network() {
            debug!("network is disabled; pending writes wait until it is enabled");
        }
        let (callback, receiver) = oneshot::channel();
        self.core.register_pending_writes_callback(callback)?;
        Ok(receiver)
    }

    /// Runs `query` against the local cache only.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> EngineResult<QueryResult> {
        self.ensure_running()?;
        self.local_store.execute_query(query, use_previous_results)
    }

    /// Re-enables the network.
    pub fn enable_network(&mut self) -> EngineResult<()> {
        self.ensure_running()?;
        self.remote_store.enable_network(&mut self.queue, &mut self.core)?;
        self.drain_commands()
    }

    /// Closes both streams and reports the client offline.
    pub fn disable_network(&mut self) -> EngineResult<()> {
        self.ensure_running()?;
        self.remote_store.disable_network(&mut self.queue, &mut self.core)?;
        self.drain_commands()
    }

    /// Switches to `user` and restarts the streams with the new credential.
    pub fn handle_credential_change(&mut self, user: User) -> EngineResult<()> {
        self.ensure_running()?;
        self.core.handle_credential_change(user)?;
        self.remote_store
            .handle_credential_change(&mut self.queue, &mut self.core)?;
        self.drain_commands()
    }

    /// Promotes the client to primary or demotes it to secondary.
    pub fn apply_primary_state(&mut self, is_primary: bool) -> EngineResult<()> {
        self.ensure_running()?;
        self.core.apply_primary_state(is_primary)?;
        self.drain_commands()
    }

    /// Applies a batch state published by the primary client.
    pub fn apply_batch_state(
        &mut self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<EngineError>,
    ) -> EngineResult<()> {
        self.ensure_running()?;
        self.core.apply_batch_state(batch_id, state, error)?;
        self.drain_commands()
    }

    /// Applies a target state published by the primary client.
    pub fn apply_target_state(
        &mut self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<EngineError>,
    ) -> EngineResult<()> {
        self.ensure_running()?;
        self.core.apply_target_state(target_id, state, error)?;
        self.drain_commands()
    }

    /// Processes one transport event.
    pub fn handle_stream_event(&mut self, event: StreamEvent) -> EngineResult<()> {
        if self.shut_down {
            trace!(kind = %event.kind, "dropping stream event after shutdown");
            return Ok(());
        }
        self.remote_store
            .handle_stream_event(&mut self.queue, &mut self.core, event)?;
        self.drain_commands()
    }

    /// The current virtual time.
    pub fn now(&self) -> Duration {
        self.queue.now()
    }

    /// The earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.queue.next_deadline()
    }

    /// True if a timer is pending for `timer_id`.
    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.queue.contains_delayed_operation(timer_id)
    }

    /// Runs every timer due at or before `time`, then moves the clock to
    /// `time`.
    pub fn advance_to(&mut self, time: Duration) -> EngineResult<()> {
        while let Some(timer_id) = self.queue.pop_due(time) {
            self.run_timer(timer_id)?;
        }
        self.queue.advance_clock(time);
        Ok(())
    }

    /// Runs timers in deadline order, ahead of time, up to and including
    /// the first `timer_id`. Returns false if `timer_id` never fired.
    pub fn run_delayed_operations_until(&mut self, timer_id: TimerId) -> EngineResult<bool> {
        while let Some(next) = self.queue.pop_next() {
            self.run_timer(next)?;
            if next == timer_id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn run_timer(&mut self, timer_id: TimerId) -> EngineResult<()> {
        trace!(%timer_id, now = ?self.queue.now(), "running delayed operation");
        self.remote_store
            .handle_timer(&mut self.queue, &mut self.core, timer_id)?;
        self.drain_commands()
    }

    /// Takes the events raised since the last call.
    pub fn drain_events(&mut self) -> Vec<SyncEngineEvent> {
        std::mem::take(&mut self.core.events)
    }

    /// Stops the network. Every later call fails with
    /// [`EngineError::Shutdown`].
    pub fn shutdown(&mut self) -> EngineResult<()> {
        if self.shut_down {
            return Ok(());
        }
        info!("sync engine shutting down");
        self.remote_store.shutdown(&mut self.queue, &mut self.core)?;
        self.core.commands.clear();
        self.core
            .reject_outstanding_pending_writes_callbacks("pending writes wait cancelled by shutdown");
        self.shut_down = true;
        Ok(())
    }

    /// The current online state.
    pub fn online_state(&self) -> OnlineState {
        self.remote_store.online_state()
    }

    /// The local store shared with the remote store.
    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    /// The remote store, for inspection.
    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    /// The current user.
    pub fn current_user(&self) -> &User {
        &self.core.current_user
    }

    /// True if this client drives the network.
    pub fn is_primary(&self) -> bool {
        self.core.is_primary
    }

    /// Keys with an active limbo resolution target, with their target ids.
    pub fn active_limbo_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.core.active_limbo_targets_by_key.clone()
    }

    /// Keys waiting for a limbo resolution slot, oldest first.
    pub fn enqueued_limbo_resolutions(&self) -> Vec<DocumentKey> {
        self.core.enqueued_limbo_resolutions.iter().cloned().collect()
    }

    /// Target id of an active query.
    pub fn target_id_for_query(&self, query: &Query) -> Option<TargetId> {
        self.core
            .query_views_by_query
            .get(&query.canonical_id())
            .map(|query_view| query_view.target_id)
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if self.shut_down {
            Err(EngineError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Forwards the core's network requests until none remain. Remote store
    /// callbacks may add more while this runs.
    fn drain_commands(&mut self) -> EngineResult<()> {
        while let Some(command) = self.core.commands.pop_front() {
            match command {
                RemoteCommand::Listen(target_data) => {
                    if self.remote_store.listen_target(target_data.target_id).is_none() {
                        self.remote_store.listen(&mut self.queue, &mut self.core, target_data);
                    }
                }
                RemoteCommand::Unlisten(target_id) => {
                    self.remote_store.unlisten(&mut self.queue, &mut self.core, target_id);
                }
                RemoteCommand::FillWritePipeline => {
                    self.remote_store.fill_write_pipeline(&mut self.queue, &mut self.core)?;
                }
                RemoteCommand::ApplyPrimaryState(is_primary) => {
                    self.remote_store
                        .apply_primary_state(&mut self.queue, &mut self.core, is_primary)?;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("now", &self.queue.now())
            .field("core", &self.core)
            .field("remote_store", &self.remote_store)
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shared_client_state::MemorySharedClientState;
    use crate::remote::{stream_event_channel, EmptyCredentialsProvider, MockConnection, StreamEventReceiver};
    use docsync_model::{FieldValue, ObjectValue, ResourcePath};
    use docsync_protocol::{ListenRequest, WriteRequest, WriteResponse, WriteResult};
    use docsync_storage::MemoryPersistence;

    struct Harness {
        engine: SyncEngine,
        connection: Arc<MockConnection>,
        shared: Arc<MemorySharedClientState>,
        stream_events: StreamEventReceiver,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(EngineConfig::default())
        }

        fn with_config(config: EngineConfig) -> Self {
            let connection = Arc::new(MockConnection::new());
            let shared = Arc::new(MemorySharedClientState::new());
            let (events, stream_events) = stream_event_channel();
            let mut engine = SyncEngine::new(
                Arc::new(MemoryPersistence::new()),
                connection.clone(),
                Arc::new(EmptyCredentialsProvider),
                shared.clone(),
                &config,
                User::UNAUTHENTICATED,
                events,
            );
            engine.start().unwrap();
            Self {
                engine,
                connection,
                shared,
                stream_events,
            }
        }

        fn pump(&mut self) {
            while let Ok(event) = self.stream_events.try_recv() {
                self.engine.handle_stream_event(event).unwrap();
            }
        }

        fn snapshots(&mut self) -> Vec<ViewSnapshot> {
            self.engine
                .drain_events()
                .into_iter()
                .filter_map(|event| match event {
                    SyncEngineEvent::Snapshots(snapshots) => Some(snapshots),
                    _ => None,
                })
                .flatten()
                .collect()
        }
    }

    fn rooms() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap())
    }

    fn set(path: &str, n: i64) -> Mutation {
        Mutation::set(
            DocumentKey::from_string(path).unwrap(),
            ObjectValue::from_fields([("n", FieldValue::from(n))]),
        )
    }

    #[test]
    fn listening_allocates_a_target_and_opens_the_watch_stream() {
        let mut h = Harness::new();
        let snapshot = h.engine.listen(rooms()).unwrap();
        assert!(snapshot.docs.is_empty());
        assert!(snapshot.from_cache);
        assert_eq!(h.engine.target_id_for_query(&rooms()), Some(TargetId(2)));
        assert_eq!(h.connection.listen_stream_count(), 1);

        h.connection.listen_sink().unwrap().on_open();
        h.pump();
        let requests = h.connection.listen_requests();
        assert!(matches!(requests.as_slice(), [ListenRequest::AddTarget(target)] if target.target_id == TargetId(2)));
    }

    #[test]
    fn identical_queries_share_a_view() {
        let mut h = Harness::new();
        h.engine.listen(rooms()).unwrap();
        let second = h.engine.listen(rooms()).unwrap();
        assert!(second.docs.is_empty());
        assert_eq!(h.connection.listen_stream_count(), 1);
        assert_eq!(h.shared.active_targets(), vec![TargetId(2)]);
    }

    #[test]
    fn writes_raise_optimistic_snapshots() {
        let mut h = Harness::new();
        h.engine.listen(rooms()).unwrap();
        let _ack = h.engine.write(vec![set("rooms/eros", 1)]).unwrap();

        let snapshots = h.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].docs.len(), 1);
        assert!(snapshots[0].has_pending_writes());
        assert_eq!(h.shared.mutation_state(BatchId(1)), Some(MutationBatchState::Pending));
    }

    #[test]
    fn acknowledgement_resolves_the_write_callback() {
        let mut h = Harness::new();
        let mut ack = h.engine.write(vec![set("rooms/eros", 1)]).unwrap();
        h.pump();
        let sink = h.connection.write_sink().unwrap();
        sink.on_open();
        h.pump();
        sink.on_write_message(WriteResponse::handshake(bytes::Bytes::from_static(b"token-1")));
        h.pump();
        assert!(matches!(h.connection.write_requests().last(), Some(WriteRequest::Mutations { .. })));

        sink.on_write_message(WriteResponse {
            stream_token: bytes::Bytes::from_static(b"token-2"),
            commit_time: Some(SnapshotVersion::from_micros(1_000)),
            write_results: vec![WriteResult {
                update_time: Some(SnapshotVersion::from_micros(1_000)),
                transform_results: None,
            }],
        });
        h.pump();
        assert_eq!(ack.try_recv().unwrap(), Ok(()));
        assert_eq!(h.shared.mutation_state(BatchId(1)), Some(MutationBatchState::Acknowledged));
    }

    #[test]
    fn pending_writes_wait_resolves_immediately_without_writes() {
        let mut h = Harness::new();
        let mut done = h.engine.wait_for_pending_writes().unwrap();
        assert_eq!(done.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn user_changes_cancel_pending_writes_waits() {
        let mut h = Harness::new();
        let _ack = h.engine.write(vec![set("rooms/eros", 1)]).unwrap();
        let mut done = h.engine.wait_for_pending_writes().unwrap();
        h.engine.handle_credential_change(User::new("alice")).unwrap();
        assert!(matches!(done.try_recv().unwrap(), Err(EngineError::Rpc { code: Code::Cancelled, .. })));
        assert_eq!(h.engine.current_user(), &User::new("alice"));
    }

    #[test]
    fn rejected_listens_raise_watch_errors() {
        let mut h = Harness::new();
        h.engine.listen(rooms()).unwrap();
        h.engine.drain_events();
        h.engine
            .core
            .reject_listen(TargetId(2), EngineError::rpc(Code::PermissionDenied, "nope"))
            .unwrap();
        let events = h.engine.drain_events();
        assert!(matches!(
            events.as_slice(),
            [SyncEngineEvent::WatchError { error: EngineError::Rpc { code: Code::PermissionDenied, .. }, .. }]
        ));
        assert_eq!(h.engine.target_id_for_query(&rooms()), None);
    }

    #[test]
    fn disabling_the_network_marks_views_offline() {
        let mut h = Harness::new();
        h.engine.listen(rooms()).unwrap();
        h.engine.drain_events();
        h.engine.disable_network().unwrap();
        let events = h.engine.drain_events();
        assert!(events
            .iter()
            .any(|event| matches!(event, SyncEngineEvent::OnlineStateChanged(OnlineState::Offline))));
        assert_eq!(h.shared.online_state(), Some(OnlineState::Offline));
    }

    #[test]
    fn calls_after_shutdown_fail() {
        let mut h = Harness::new();
        h.engine.shutdown().unwrap();
        assert_eq!(h.engine.listen(rooms()).unwrap_err(), EngineError::Shutdown);
        assert!(h.engine.write(vec![set("rooms/eros", 1)]).is_err());
    }
}
