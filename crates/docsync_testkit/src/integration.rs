//! Cross-crate integration test helpers.
//!
//! [`SyncHarness`] wires a [`SyncEngine`] to in-memory persistence and a
//! [`MockConnection`], then lets a test play the backend: open streams,
//! send watch changes, acknowledge writes and move the virtual clock.

use crate::fixtures::{init_tracing, token};
use bytes::Bytes;
use docsync_engine::{
    stream_event_channel, EmptyCredentialsProvider, EngineConfig, EngineResult, MemorySharedClientState,
    MockConnection, StreamEventReceiver, StreamSink, SyncEngine, SyncEngineEvent, TimerId, ViewSnapshot,
};
use docsync_model::{DocumentKey, Mutation, Query, SnapshotVersion, TargetId, User};
use docsync_protocol::{
    Code, ListenRequest, ListenResponse, RpcStatus, TargetChangeKind, WireDocument, WriteRequest, WriteResponse,
    WriteResult,
};
use docsync_storage::MemoryPersistence;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Pending completion of a write or a pending-writes wait.
pub type Completion = oneshot::Receiver<EngineResult<()>>;

/// Returns the outcome of `completion` if it resolved.
pub fn try_complete(completion: &mut Completion) -> Option<EngineResult<()>> {
    completion.try_recv().ok()
}

/// A sync engine with a scripted backend.
pub struct SyncHarness {
    /// The engine under test.
    pub engine: SyncEngine,
    /// The mock transport.
    pub connection: Arc<MockConnection>,
    /// The persistence layer.
    pub persistence: Arc<MemoryPersistence>,
    /// The shared client state.
    pub shared: Arc<MemorySharedClientState>,
    stream_events: StreamEventReceiver,
    events: Vec<SyncEngineEvent>,
    write_stream: usize,
    acknowledged_on_stream: usize,
}

impl SyncHarness {
    /// Creates a started engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Creates a started engine with `config`.
    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_persistence(config, Arc::new(MemoryPersistence::new()))
    }

    /// Creates a started engine over existing persistence.
    pub fn with_persistence(config: EngineConfig, persistence: Arc<MemoryPersistence>) -> Self {
        init_tracing();
        let connection = Arc::new(MockConnection::new());
        let shared = Arc::new(MemorySharedClientState::new());
        let (sender, stream_events) = stream_event_channel();
        let mut engine = SyncEngine::new(
            persistence.clone(),
            connection.clone(),
            Arc::new(EmptyCredentialsProvider),
            shared.clone(),
            &config,
            User::UNAUTHENTICATED,
            sender,
        );
        engine.start().expect("Failed to start engine");
        Self {
            engine,
            connection,
            persistence,
            shared,
            stream_events,
            events: Vec::new(),
            write_stream: 0,
            acknowledged_on_stream: 0,
        }
    }

    /// Feeds every queued transport event to the engine.
    pub fn pump(&mut self) {
        while let Ok(event) = self.stream_events.try_recv() {
            self.engine
                .handle_stream_event(event)
                .expect("Failed to handle stream event");
        }
        self.events.extend(self.engine.drain_events());
    }

    /// Listens to `query` and returns the initial snapshot.
    pub fn listen(&mut self, query: Query) -> ViewSnapshot {
        let snapshot = self.engine.listen(query).expect("Failed to listen");
        self.pump();
        snapshot
    }

    /// Stops listening to `query`.
    pub fn unlisten(&mut self, query: &Query) {
        self.engine.unlisten(query).expect("Failed to unlisten");
        self.pump();
    }

    /// Writes a batch and returns its completion.
    pub fn write(&mut self, mutations: Vec<Mutation>) -> Completion {
        let completion = self.engine.write(mutations).expect("Failed to write");
        self.pump();
        completion
    }

    /// Events raised so far, in order.
    pub fn take_events(&mut self) -> Vec<SyncEngineEvent> {
        self.events.extend(self.engine.drain_events());
        std::mem::take(&mut self.events)
    }

    /// Snapshots raised so far, in order.
    pub fn take_snapshots(&mut self) -> Vec<ViewSnapshot> {
        self.take_events()
            .into_iter()
            .filter_map(|event| match event {
                SyncEngineEvent::Snapshots(snapshots) => Some(snapshots),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// The most recent snapshot raised so far, dropping the rest.
    pub fn last_snapshot(&mut self) -> Option<ViewSnapshot> {
        self.take_snapshots().pop()
    }

    // Watch stream.

    fn listen_sink(&self) -> StreamSink {
        self.connection.listen_sink().expect("No watch stream opened")
    }

    /// Reports the latest watch stream as open.
    pub fn open_watch(&mut self) {
        self.listen_sink().on_open();
        self.pump();
    }

    /// Delivers a watch message.
    pub fn watch(&mut self, response: ListenResponse) {
        self.listen_sink().on_listen_message(response);
        self.pump();
    }

    /// Acknowledges that `target_ids` were added.
    pub fn watch_ack(&mut self, target_ids: &[TargetId]) {
        self.watch(ListenResponse::target_change(TargetChangeKind::Added, target_ids.to_vec(), Bytes::new()));
    }

    /// Marks `target_ids` current as of `resume_token`.
    pub fn watch_current(&mut self, target_ids: &[TargetId], resume_token: &str) {
        self.watch(ListenResponse::target_change(
            TargetChangeKind::Current,
            target_ids.to_vec(),
            token(resume_token),
        ));
    }

    /// Sends a consistent global snapshot at `version`.
    pub fn watch_snapshot(&mut self, version: SnapshotVersion, resume_token: &str) {
        self.watch(ListenResponse::global_snapshot(version, token(resume_token)));
    }

    /// Sends `document` as matching `target_ids`.
    pub fn watch_doc(&mut self, document: WireDocument, target_ids: &[TargetId]) {
        self.watch(ListenResponse::DocumentChange {
            document,
            target_ids: target_ids.to_vec(),
            removed_target_ids: Vec::new(),
        });
    }

    /// Sends a delete of `key` at `version`.
    pub fn watch_delete(&mut self, key: DocumentKey, version: SnapshotVersion, removed_target_ids: &[TargetId]) {
        self.watch(ListenResponse::DocumentDelete {
            key,
            read_time: version,
            removed_target_ids: removed_target_ids.to_vec(),
        });
    }

    /// Rejects `target_ids` with `code`.
    pub fn watch_remove(&mut self, target_ids: &[TargetId], code: Code) {
        self.watch(ListenResponse::TargetChange {
            kind: TargetChangeKind::Removed,
            target_ids: target_ids.to_vec(),
            resume_token: Bytes::new(),
            cause: Some(RpcStatus::new(code, "target removed")),
            read_time: None,
        });
    }

    /// Sends an existence filter for `target_id`.
    pub fn watch_filter(&mut self, target_id: TargetId, count: usize) {
        self.watch(ListenResponse::ExistenceFilter { target_id, count });
    }

    /// Acknowledges, marks current and snapshots `target_ids` with the given
    /// documents in one go.
    pub fn watch_sync(
        &mut self,
        target_ids: &[TargetId],
        documents: Vec<WireDocument>,
        version: SnapshotVersion,
        resume_token: &str,
    ) {
        self.watch_ack(target_ids);
        for document in documents {
            self.watch_doc(document, target_ids);
        }
        self.watch_current(target_ids, resume_token);
        self.watch_snapshot(version, resume_token);
    }

    /// Closes the watch stream from the backend side.
    pub fn close_watch(&mut self, code: Code) {
        self.listen_sink().on_close(RpcStatus::new(code, "watch stream closed"));
        self.pump();
    }

    /// Requests sent on the latest watch stream.
    pub fn listen_requests(&self) -> Vec<ListenRequest> {
        self.connection.listen_requests()
    }

    /// Targets added on the latest watch stream and not removed since.
    pub fn active_watch_targets(&self) -> Vec<TargetId> {
        let mut targets = Vec::new();
        for request in self.listen_requests() {
            match request {
                ListenRequest::AddTarget(target) => targets.push(target.target_id),
                ListenRequest::RemoveTarget(target_id) => targets.retain(|id| *id != target_id),
            }
        }
        targets
    }

    // Write stream.

    fn write_sink(&self) -> StreamSink {
        self.connection.write_sink().expect("No write stream opened")
    }

    /// Opens the write stream and acknowledges its handshake.
    pub fn open_write(&mut self, stream_token: &str) {
        self.write_sink().on_open();
        self.pump();
        self.write_sink()
            .on_write_message(WriteResponse::handshake(token(stream_token)));
        self.pump();
    }

    /// Batches sent on the latest write stream, handshake excluded.
    pub fn sent_writes(&self) -> Vec<Vec<Mutation>> {
        self.connection
            .write_requests()
            .into_iter()
            .filter_map(|request| match request {
                WriteRequest::Mutations { writes, .. } if !writes.is_empty() => Some(writes),
                _ => None,
            })
            .collect()
    }

    /// Acknowledges the oldest unacknowledged batch at `version`.
    pub fn ack_write(&mut self, version: SnapshotVersion) {
        let stream = self.connection.write_stream_count();
        if stream != self.write_stream {
            self.write_stream = stream;
            self.acknowledged_on_stream = 0;
        }
        let batch = self
            .sent_writes()
            .into_iter()
            .nth(self.acknowledged_on_stream)
            .expect("No unacknowledged batch on the write stream");
        self.acknowledged_on_stream += 1;

        let response = WriteResponse {
            stream_token: token(&format!("ack-{}", version.to_micros())),
            commit_time: Some(version),
            write_results: batch
                .iter()
                .map(|_| WriteResult {
                    update_time: Some(version),
                    transform_results: None,
                })
                .collect(),
        };
        self.write_sink().on_write_message(response);
        self.pump();
    }

    /// Closes the write stream from the backend side with `code`. A
    /// permanent code rejects the oldest unacknowledged batch.
    pub fn close_write(&mut self, code: Code) {
        self.write_sink()
            .on_close(RpcStatus::new(code, "write stream closed"));
        self.pump();
    }

    // Clock.

    /// Moves the virtual clock forward by `delay`, running due timers.
    pub fn advance(&mut self, delay: Duration) {
        let time = self.engine.now() + delay;
        self.engine.advance_to(time).expect("Failed to advance clock");
        self.pump();
    }

    /// Runs timers early up to and including `timer_id`.
    pub fn run_timer(&mut self, timer_id: TimerId) -> bool {
        let fired = self
            .engine
            .run_delayed_operations_until(timer_id)
            .expect("Failed to run delayed operations");
        self.pump();
        fired
    }
}

impl Default for SyncHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{query, set_mutation, version};

    #[test]
    fn harness_plays_a_listen_round_trip() {
        let mut h = SyncHarness::new();
        h.listen(query("rooms"));
        h.open_watch();
        assert_eq!(h.active_watch_targets(), vec![TargetId(2)]);

        h.watch_sync(&[TargetId(2)], Vec::new(), version(1), "resume-1");
        let snapshot = h.last_snapshot().expect("snapshot after sync");
        assert!(!snapshot.from_cache);
    }

    #[test]
    fn harness_acknowledges_writes_in_order() {
        let mut h = SyncHarness::new();
        let mut first = h.write(vec![set_mutation("rooms/a", [("n", 1_i64)])]);
        let mut second = h.write(vec![set_mutation("rooms/b", [("n", 2_i64)])]);
        h.open_write("stream-0");
        assert_eq!(h.sent_writes().len(), 2);

        h.ack_write(version(5));
        assert!(matches!(try_complete(&mut first), Some(Ok(()))));
        assert!(try_complete(&mut second).is_none());
        h.ack_write(version(6));
        assert!(matches!(try_complete(&mut second), Some(Ok(()))));
    }
}
