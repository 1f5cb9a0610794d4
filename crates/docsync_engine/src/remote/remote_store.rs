//! The remote channel manager.
//!
//! [`RemoteStore`] owns the watch and write streams. It keeps the set of
//! listened targets (resent whenever the watch stream reopens) and a bounded
//! pipeline of mutation batches (resent after every write handshake), folds
//! watch traffic into [`RemoteEvent`]s and hands results to a
//! [`RemoteSyncer`].
//!
//! All methods run on the core queue. They receive the queue and the syncer
//! explicitly instead of holding references to them.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::local::LocalStore;
use crate::queue::{AsyncQueue, TimerId};
use crate::remote::connection::{Connection, StreamEvent, StreamEventSender, StreamKind, StreamPayload};
use crate::remote::credentials::CredentialsProvider;
use crate::remote::online_state::{OnlineState, OnlineStateTracker};
use crate::remote::persistent_stream::{PersistentStream, WatchStream, WriteStream, WriteStreamResponse};
use crate::remote::remote_event::RemoteEvent;
use crate::remote::watch_change::{TargetMetadataProvider, WatchChange, WatchChangeAggregator};
use bytes::Bytes;
use docsync_model::{
    BatchId, DocumentKeySet, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion, TargetData,
    TargetId, TargetPurpose,
};
use docsync_protocol::{ListenResponse, RpcStatus, TargetChangeKind, WriteResponse};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The sync engine as seen by the remote store.
pub trait RemoteSyncer {
    /// Applies a consistent snapshot from the watch stream.
    fn apply_remote_event(&mut self, event: RemoteEvent) -> EngineResult<()>;

    /// The backend refused or dropped a listen.
    fn reject_listen(&mut self, target_id: TargetId, error: EngineError) -> EngineResult<()>;

    /// The oldest pipeline batch was committed.
    fn apply_successful_write(&mut self, result: MutationBatchResult) -> EngineResult<()>;

    /// The backend permanently rejected a batch.
    fn reject_failed_write(&mut self, batch_id: BatchId, error: EngineError) -> EngineResult<()>;

    /// Keys the target matched as of the last applied remote event.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// The online state changed.
    fn handle_online_state_change(&mut self, state: OnlineState);
}

/// Reasons the network is not used. The network is usable when the set is
/// empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OfflineCause {
    /// The user called `disable_network`, or the store was never started.
    UserDisabled,
    /// Another client owns the network.
    IsSecondary,
    /// Streams are restarting with new credentials.
    CredentialChange,
    /// Local persistence failed; a probe is pending.
    PersistenceFailure,
    /// The client shut down.
    Shutdown,
}

/// Target metadata drawn from the listen targets and the syncer.
struct ListenTargetMetadata<'a> {
    listen_targets: &'a HashMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenTargetMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Owns the network streams of one client.
pub struct RemoteStore {
    local_store: Arc<LocalStore>,
    max_pending_writes: usize,
    persistence_probe_interval: Duration,
    listen_targets: HashMap<TargetId, TargetData>,
    write_pipeline: VecDeque<MutationBatch>,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    watch_change_aggregator: Option<WatchChangeAggregator>,
    online_state: OnlineStateTracker,
    offline_causes: BTreeSet<OfflineCause>,
}

impl RemoteStore {
    /// Creates a stopped remote store. Transport events are delivered to
    /// `events`.
    pub fn new(
        local_store: Arc<LocalStore>,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        events: StreamEventSender,
        config: &EngineConfig,
    ) -> Self {
        let watch_stream = WatchStream::new(PersistentStream::new(
            TimerId::ListenStreamIdle,
            TimerId::ListenStreamConnectionBackoff,
            config,
            Arc::clone(&connection),
            Arc::clone(&credentials),
            events.clone(),
        ));
        let write_stream = WriteStream::new(PersistentStream::new(
            TimerId::WriteStreamIdle,
            TimerId::WriteStreamConnectionBackoff,
            config,
            connection,
            credentials,
            events,
        ));
        Self {
            local_store,
            max_pending_writes: config.max_pending_writes,
            persistence_probe_interval: config.persistence_probe_interval,
            listen_targets: HashMap::new(),
            write_pipeline: VecDeque::new(),
            watch_stream,
            write_stream,
            watch_change_aggregator: None,
            online_state: OnlineStateTracker::new(config.online_state_timeout),
            offline_causes: BTreeSet::from([OfflineCause::UserDisabled, OfflineCause::IsSecondary]),
        }
    }

    /// Enables the network. Streams open once the client is also primary.
    pub fn start(&mut self, queue: &mut AsyncQueue, syncer: &mut dyn RemoteSyncer) -> EngineResult<()> {
        self.enable_network(queue, syncer)
    }

    /// The current online state.
    pub fn online_state(&self) -> OnlineState {
        self.online_state.state()
    }

    /// True when nothing keeps the client offline.
    pub fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    /// The reasons the network is unused.
    pub fn offline_causes(&self) -> &BTreeSet<OfflineCause> {
        &self.offline_causes
    }

    /// Metadata of a listened target, with the latest resume token.
    pub fn listen_target(&self, target_id: TargetId) -> Option<&TargetData> {
        self.listen_targets.get(&target_id)
    }

    /// Number of batches sent or waiting to be sent.
    pub fn outstanding_writes(&self) -> usize {
        self.write_pipeline.len()
    }

    /// Re-enables the network after [`RemoteStore::disable_network`].
    pub fn enable_network(&mut self, queue: &mut AsyncQueue, syncer: &mut dyn RemoteSyncer) -> EngineResult<()> {
        self.offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal(queue, syncer)
    }

    /// Stops both streams and reports the client offline.
    pub fn disable_network(&mut self, queue: &mut AsyncQueue, syncer: &mut dyn RemoteSyncer) -> EngineResult<()> {
        self.offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal(queue, syncer)?;
        let change = self.online_state.set(queue, OnlineState::Offline);
        Self::broadcast(syncer, change);
        Ok(())
    }

    /// Stops both streams for good.
    pub fn shutdown(&mut self, queue: &mut AsyncQueue, syncer: &mut dyn RemoteSyncer) -> EngineResult<()> {
        debug!("remote store shutting down");
        self.offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal(queue, syncer)?;
        let change = self.online_state.set(queue, OnlineState::Unknown);
        Self::broadcast(syncer, change);
        Ok(())
    }

    /// Restarts both streams so they pick up the new credential.
    pub fn handle_credential_change(
        &mut self,
        queue: &mut AsyncQueue,
        syncer: &mut dyn RemoteSyncer,
    ) -> EngineResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        debug!("restarting streams for new credential");
        self.offline_causes.insert(OfflineCause::CredentialChange);
        self.disable_network_internal(queue, syncer)?;
        let change = self.online_state.set(queue, OnlineState::Unknown);
        Self::broadcast(syncer, change);
        self.offline_causes.remove(&OfflineCause::CredentialChange);
        self.enable_network_internal(queue, syncer)
    }

    /// Switches between primary and secondary. Only the primary uses the
    /// network.
    pub fn apply_primary_state(
        &mut self,
        queue: &mut AsyncQueue,
        syncer: &mut dyn RemoteSyncer,
        is_primary: bool,
    ) -> EngineResult<()> {
        if is_primary {
            self.offline_causes.remove(&OfflineCause::IsSecondary);
            self.enable_network_internal(queue, syncer)
        } else {
            self.offline_causes.insert(OfflineCause::IsSecondary);
            self.disable_network_internal(queue, syncer)?;
            let change = self.online_state.set(queue, OnlineState::Unknown);
            Self::broadcast(syncer, change);
            Ok(())
        }
    }

    /// Starts listening to a target, opening the watch stream if needed.
    pub fn listen(&mut self, queue: &mut AsyncQueue, syncer: &mut dyn RemoteSyncer, target_data: TargetData) {
        let target_id = target_data.target_id;
        assert!(
            !self.listen_targets.contains_key(&target_id),
            "listen called with duplicate target id {target_id}"
        );
        self.listen_targets.insert(target_id, target_data.clone());

        if self.should_start_watch_stream() {
            self.start_watch_stream(queue, syncer);
        } else if self.watch_stream.stream().is_open() {
            self.send_watch_request(queue, &target_data);
        }
    }

    /// Stops listening to a target. Unknown targets are ignored; the backend
    /// may already have removed them.
    pub fn unlisten(&mut self, queue: &mut AsyncQueue, syncer: &mut dyn RemoteSyncer, target_id: TargetId) {
        if self.listen_targets.remove(&target_id).is_none() {
            debug!(%target_id, "unlisten of a target that is not listened to");
            return;
        }
        if self.watch_stream.stream().is_open() {
            self.send_unwatch_request(queue, target_id);
        }
        if self.listen_targets.is_empty() {
            if self.watch_stream.stream().is_open() {
                self.watch_stream.stream_mut().mark_idle(queue);
            } else if self.can_use_network() {
                // No listen targets means the client is neither online nor
                // offline.
                let change = self.online_state.set(queue, OnlineState::Unknown);
                Self::broadcast(syncer, change);
            }
        }
    }

    /// Pulls queued batches into the write pipeline and starts the write
    /// stream when there is something to send.
    pub fn fill_write_pipeline(&mut self, queue: &mut AsyncQueue, syncer: &mut dyn RemoteSyncer) -> EngineResult<()> {
        while self.can_add_to_write_pipeline() {
            let last_batch_id = self.write_pipeline.back().map_or(BatchId::UNKNOWN, |batch| batch.batch_id);
            match self.local_store.next_mutation_batch(last_batch_id) {
                Ok(Some(batch)) => self.add_to_write_pipeline(queue, batch),
                Ok(None) => {
                    if self.write_pipeline.is_empty() {
                        self.write_stream.stream_mut().mark_idle(queue);
                    }
                    break;
                }
                Err(err) => return self.recover(queue, syncer, Err(err)),
            }
        }
        if self.should_start_write_stream() {
            self.start_write_stream(queue, syncer)?;
        }
        Ok(())
    }

    /// Routes a transport event to its stream. Events from closed stream
    /// generations are dropped.
    pub fn handle_stream_event(
        &mut self,
        queue: &mut AsyncQueue,
        syncer: &mut dyn RemoteSyncer,
        event: StreamEvent,
    ) -> EngineResult<()> {
        let generation = event.generation;
        match (event.kind, event.payload) {
            (StreamKind::Watch, StreamPayload::Open) => {
                if self.watch_stream.stream_mut().handle_open(generation) {
                    self.on_watch_stream_open(queue);
                }
            }
            (StreamKind::Watch, StreamPayload::ListenMessage(message)) => {
                if self.watch_stream.accept_message(generation) {
                    return self.on_watch_stream_change(queue, syncer, message);
                }
                debug!(generation, "ignoring watch message from a closed stream");
            }
            (StreamKind::Watch, StreamPayload::Close(status)) => {
                if self.watch_stream.stream_mut().handle_close(queue, generation, &status, None) {
                    self.on_watch_stream_close(queue, syncer, Some(status));
                }
            }
            (StreamKind::Write, StreamPayload::Open) => {
                if self.write_stream.stream_mut().handle_open(generation) {
                    self.write_stream.write_handshake(queue);
                }
            }
            (StreamKind::Write, StreamPayload::WriteMessage(response)) => {
                return self.on_write_stream_response(queue, syncer, generation, response);
            }
            (StreamKind::Write, StreamPayload::Close(status)) => {
                if self.write_stream.stream_mut().handle_close(queue, generation, &status, None) {
                    return self.on_write_stream_close(queue, syncer, Some(status));
                }
            }
            (kind, payload) => warn!(%kind, ?payload, "stream event does not match its stream"),
        }
        Ok(())
    }

    /// Runs a timer owned by the remote store.
    pub fn handle_timer(
        &mut self,
        queue: &mut AsyncQueue,
        syncer: &mut dyn RemoteSyncer,
        timer_id: TimerId,
    ) -> EngineResult<()> {
        match timer_id {
            TimerId::ListenStreamIdle => {
                if self.watch_stream.stream_mut().handle_idle_timeout(queue, None) {
                    self.on_watch_stream_close(queue, syncer, None);
                }
            }
            TimerId::ListenStreamConnectionBackoff => {
                if let Err(status) = self.watch_stream.stream_mut().handle_backoff_elapsed(queue) {
                    self.on_watch_stream_close(queue, syncer, Some(status));
                }
            }
            TimerId::WriteStreamIdle => {
                let farewell = self.write_stream.farewell();
                if self.write_stream.stream_mut().handle_idle_timeout(queue, farewell) {
                    return self.on_write_stream_close(queue, syncer, None);
                }
            }
            TimerId::WriteStreamConnectionBackoff => {
                if let Err(status) = self.write_stream.handle_backoff_elapsed(queue) {
                    return self.on_write_stream_close(queue, syncer, Some(status));
                }
            }
            TimerId::OnlineStateTimeout => {
                let change = self.online_state.handle_timeout();
                Self::broadcast(syncer, change);
            }
            TimerId::PersistenceProbe => return self.handle_persistence_probe(queue, syncer),
        }
        Ok(())
    }

    fn enable_network_internal(&mut self, queue: &mut AsyncQueue, syncer: &mut dyn RemoteSyncer) -> EngineResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        match self.local_store.get_last_stream_token() {
            Ok(token) => self.write_stream.set_last_stream_token(token),
            Err(err) => return self.recover(queue, syncer, Err(err)),
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream(queue, syncer);
        } else {
            let change = self.online_state.set(queue, OnlineState::Unknown);
            Self::broadcast(syncer, change);
        }
        self.fill_write_pipeline(queue, syncer)
    }

    fn disable_network_internal(&mut self, queue: &mut AsyncQueue, syncer: &mut dyn RemoteSyncer) -> EngineResult<()> {
        let farewell = self.write_stream.farewell();
        if self.write_stream.stream_mut().stop(queue, farewell) {
            self.on_write_stream_close(queue, syncer, None)?;
        }
        if self.watch_stream.stream_mut().stop(queue, None) {
            self.on_watch_stream_close(queue, syncer, None);
        }
        if !self.write_pipeline.is_empty() {
            debug!(pending = self.write_pipeline.len(), "stopping write stream with pending writes");
            self.write_pipeline.clear();
        }
        self.watch_change_aggregator = None;
        Ok(())
    }

    /// Turns persistence failures into an offline period; other errors pass
    /// through.
    fn recover(
        &mut self,
        queue: &mut AsyncQueue,
        syncer: &mut dyn RemoteSyncer,
        result: EngineResult<()>,
    ) -> EngineResult<()> {
        match result {
            Err(err) if err.is_persistence_failure() => self.disable_network_until_recovery(queue, syncer, &err),
            other => other,
        }
    }

    fn disable_network_until_recovery(
        &mut self,
        queue: &mut AsyncQueue,
        syncer: &mut dyn RemoteSyncer,
        error: &EngineError,
    ) -> EngineResult<()> {
        warn!(%error, "persistence failed, disabling network until it recovers");
        self.offline_causes.insert(OfflineCause::PersistenceFailure);
        self.disable_network_internal(queue, syncer)?;
        let change = self.online_state.set(queue, OnlineState::Offline);
        Self::broadcast(syncer, change);
        queue.enqueue_after_delay(TimerId::PersistenceProbe, self.persistence_probe_interval);
        Ok(())
    }

    fn handle_persistence_probe(&mut self, queue: &mut AsyncQueue, syncer: &mut dyn RemoteSyncer) -> EngineResult<()> {
        match self.local_store.get_last_remote_snapshot_version() {
            Ok(_) => {
                info!("persistence recovered, re-enabling network");
                self.offline_causes.remove(&OfflineCause::PersistenceFailure);
                self.enable_network_internal(queue, syncer)
            }
            Err(err) if err.is_persistence_failure() => {
                debug!(error = %err, "persistence still unavailable");
                queue.enqueue_after_delay(TimerId::PersistenceProbe, self.persistence_probe_interval);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn broadcast(syncer: &mut dyn RemoteSyncer, change: Option<OnlineState>) {
        if let Some(state) = change {
            syncer.handle_online_state_change(state);
        }
    }

    // Watch stream

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.stream().is_started() && !self.listen_targets.is_empty()
    }

    fn start_watch_stream(&mut self, queue: &mut AsyncQueue, syncer: &mut dyn RemoteSyncer) {
        assert!(self.should_start_watch_stream(), "watch stream started while not needed");
        self.watch_change_aggregator = Some(WatchChangeAggregator::new());
        let started = self.watch_stream.stream_mut().start(queue);
        let change = self.online_state.handle_watch_stream_start(queue);
        Self::broadcast(syncer, change);
        if let Err(status) = started {
            self.on_watch_stream_close(queue, syncer, Some(status));
        }
    }

    fn send_watch_request(&mut self, queue: &mut AsyncQueue, target_data: &TargetData) {
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_data.target_id);
        }
        self.watch_stream.watch(queue, target_data);
    }

    fn send_unwatch_request(&mut self, queue: &mut AsyncQueue, target_id: TargetId) {
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(queue, target_id);
    }

    fn on_watch_stream_open(&mut self, queue: &mut AsyncQueue) {
        let mut targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
        targets.sort_by_key(|target_data| target_data.target_id);
        for target_data in &targets {
            self.send_watch_request(queue, target_data);
        }
    }

    fn on_watch_stream_close(&mut self, queue: &mut AsyncQueue, syncer: &mut dyn RemoteSyncer, error: Option<RpcStatus>) {
        if error.is_none() {
            assert!(
                !self.should_start_watch_stream(),
                "watch stream was stopped gracefully while still needed"
            );
        }
        self.watch_change_aggregator = None;

        if self.should_start_watch_stream() {
            if let Some(status) = &error {
                let change = self.online_state.handle_watch_stream_failure(queue, status);
                Self::broadcast(syncer, change);
            }
            self.start_watch_stream(queue, syncer);
        } else {
            let change = self.online_state.set(queue, OnlineState::Unknown);
            Self::broadcast(syncer, change);
        }
    }

    fn on_watch_stream_change(
        &mut self,
        queue: &mut AsyncQueue,
        syncer: &mut dyn RemoteSyncer,
        message: ListenResponse,
    ) -> EngineResult<()> {
        let change = self.online_state.set(queue, OnlineState::Online);
        Self::broadcast(syncer, change);

        let (watch_change, snapshot_version) = WatchChange::from_response(message);
        if let WatchChange::Target(target_change) = &watch_change {
            if target_change.state == TargetChangeKind::Removed {
                if let Some(cause) = &target_change.cause {
                    return self.handle_target_error(queue, syncer, &target_change.target_ids, cause);
                }
            }
        }

        {
            let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
                return Ok(());
            };
            let metadata = ListenTargetMetadata {
                listen_targets: &self.listen_targets,
                syncer: &*syncer,
            };
            match &watch_change {
                WatchChange::Document(change) => aggregator.handle_document_change(change, &metadata),
                WatchChange::Target(change) => aggregator.handle_target_change(change, &metadata),
                WatchChange::ExistenceFilter(change) => aggregator.handle_existence_filter(change, &metadata),
            }
        }

        if snapshot_version == SnapshotVersion::MIN {
            return Ok(());
        }
        match self.local_store.get_last_remote_snapshot_version() {
            Ok(last_remote_version) if snapshot_version >= last_remote_version => {
                self.raise_watch_snapshot(queue, syncer, snapshot_version)
            }
            Ok(last_remote_version) => {
                debug!(
                    %snapshot_version,
                    %last_remote_version,
                    "ignoring watch snapshot older than the cache"
                );
                Ok(())
            }
            Err(err) => self.recover(queue, syncer, Err(err)),
        }
    }

    fn raise_watch_snapshot(
        &mut self,
        queue: &mut AsyncQueue,
        syncer: &mut dyn RemoteSyncer,
        snapshot_version: SnapshotVersion,
    ) -> EngineResult<()> {
        assert!(snapshot_version != SnapshotVersion::MIN, "cannot raise an event for an unknown version");
        let event = {
            let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
                return Ok(());
            };
            let metadata = ListenTargetMetadata {
                listen_targets: &self.listen_targets,
                syncer: &*syncer,
            };
            aggregator.create_remote_event(snapshot_version, &metadata)
        };

        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get_mut(target_id) {
                *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        for &target_id in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.get_mut(&target_id) else {
                continue;
            };
            // Resuming would replay the same mismatch; start over.
            *target_data = target_data.with_resume_token(Bytes::new(), target_data.snapshot_version);
            let request = TargetData::new(
                target_data.target.clone(),
                target_id,
                TargetPurpose::ExistenceFilterMismatch,
                target_data.sequence_number,
            );
            self.send_unwatch_request(queue, target_id);
            self.send_watch_request(queue, &request);
        }

        let result = syncer.apply_remote_event(event);
        self.recover(queue, syncer, result)
    }

    fn handle_target_error(
        &mut self,
        queue: &mut AsyncQueue,
        syncer: &mut dyn RemoteSyncer,
        target_ids: &[TargetId],
        cause: &RpcStatus,
    ) -> EngineResult<()> {
        let error = EngineError::from(cause.clone());
        for &target_id in target_ids {
            if self.listen_targets.remove(&target_id).is_none() {
                continue;
            }
            debug!(%target_id, %cause, "backend removed target");
            if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
                aggregator.remove_target(target_id);
            }
            let result = syncer.reject_listen(target_id, error.clone());
            self.recover(queue, syncer, result)?;
        }
        Ok(())
    }

    // Write stream

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < self.max_pending_writes
    }

    fn add_to_write_pipeline(&mut self, queue: &mut AsyncQueue, batch: MutationBatch) {
        assert!(self.can_add_to_write_pipeline(), "write pipeline is full");
        if self.write_stream.stream().is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(queue, batch.mutations.clone());
        }
        self.write_pipeline.push_back(batch);
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.stream().is_started() && !self.write_pipeline.is_empty()
    }

    fn start_write_stream(&mut self, queue: &mut AsyncQueue, syncer: &mut dyn RemoteSyncer) -> EngineResult<()> {
        assert!(self.should_start_write_stream(), "write stream started while not needed");
        match self.write_stream.start(queue) {
            Ok(()) => Ok(()),
            Err(status) => self.on_write_stream_close(queue, syncer, Some(status)),
        }
    }

    fn on_write_stream_response(
        &mut self,
        queue: &mut AsyncQueue,
        syncer: &mut dyn RemoteSyncer,
        generation: u64,
        response: WriteResponse,
    ) -> EngineResult<()> {
        match self.write_stream.accept_response(generation, response) {
            Some(WriteStreamResponse::HandshakeComplete) => self.on_write_handshake_complete(queue, syncer),
            Some(WriteStreamResponse::MutationResults {
                commit_version,
                results,
            }) => self.on_mutation_result(queue, syncer, commit_version, results),
            None => {
                debug!(generation, "ignoring write response from a closed stream");
                Ok(())
            }
        }
    }

    fn on_write_handshake_complete(&mut self, queue: &mut AsyncQueue, syncer: &mut dyn RemoteSyncer) -> EngineResult<()> {
        let token = self.write_stream.last_stream_token().clone();
        let saved = self.local_store.set_last_stream_token(token);
        self.recover(queue, syncer, saved)?;
        // Resend everything still pending, oldest first.
        for batch in &self.write_pipeline {
            self.write_stream.write_mutations(queue, batch.mutations.clone());
        }
        Ok(())
    }

    fn on_mutation_result(
        &mut self,
        queue: &mut AsyncQueue,
        syncer: &mut dyn RemoteSyncer,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> EngineResult<()> {
        let Some(batch) = self.write_pipeline.pop_front() else {
            panic!("got a write result for an empty write pipeline");
        };
        debug!(batch_id = %batch.batch_id, %commit_version, "write acknowledged");
        let result = MutationBatchResult::from(
            batch,
            commit_version,
            results,
            self.write_stream.last_stream_token().clone(),
        );
        let applied = syncer.apply_successful_write(result);
        self.recover(queue, syncer, applied)?;
        self.fill_write_pipeline(queue, syncer)
    }

    fn on_write_stream_close(
        &mut self,
        queue: &mut AsyncQueue,
        syncer: &mut dyn RemoteSyncer,
        error: Option<RpcStatus>,
    ) -> EngineResult<()> {
        let Some(status) = error else {
            assert!(
                !self.should_start_write_stream(),
                "write stream was stopped gracefully while still needed"
            );
            return Ok(());
        };
        if self.write_pipeline.is_empty() {
            return Ok(());
        }
        if self.write_stream.handshake_complete() {
            self.handle_write_error(queue, syncer, &status)?;
        } else {
            self.handle_handshake_error(queue, syncer, &status)?;
        }
        if self.should_start_write_stream() {
            self.start_write_stream(queue, syncer)?;
        }
        Ok(())
    }

    fn handle_handshake_error(
        &mut self,
        queue: &mut AsyncQueue,
        syncer: &mut dyn RemoteSyncer,
        status: &RpcStatus,
    ) -> EngineResult<()> {
        if !status.code.is_permanent_error() {
            return Ok(());
        }
        debug!(%status, "write handshake failed permanently, resetting stream token");
        self.write_stream.set_last_stream_token(Bytes::new());
        let saved = self.local_store.set_last_stream_token(Bytes::new());
        self.recover(queue, syncer, saved)
    }

    fn handle_write_error(
        &mut self,
        queue: &mut AsyncQueue,
        syncer: &mut dyn RemoteSyncer,
        status: &RpcStatus,
    ) -> EngineResult<()> {
        if !status.code.is_permanent_write_error() {
            return Ok(());
        }
        let Some(batch) = self.write_pipeline.pop_front() else {
            return Ok(());
        };
        warn!(batch_id = %batch.batch_id, %status, "backend rejected write");
        // The stream is healthy; the batch was the problem.
        self.write_stream.stream_mut().inhibit_backoff();
        let rejected = syncer.reject_failed_write(batch.batch_id, EngineError::from(status.clone()));
        self.recover(queue, syncer, rejected)?;
        self.fill_write_pipeline(queue, syncer)
    }
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("listen_targets", &self.listen_targets.len())
            .field("write_pipeline", &self.write_pipeline.len())
            .field("online_state", &self.online_state.state())
            .field("offline_causes", &self.offline_causes)
            .finish_non_exhaustive()
    }
}
