//! Auto-reconnecting streams.
//!
//! A [`PersistentStream`] moves through
//! `Initial → Starting → Open → {Error → Backoff → Initial, Initial}`.
//! It never talks to its owner directly: operations that close the stream
//! report it through their return value and the owner runs its own close
//! handling. Every close bumps the close generation, so transport events from
//! an earlier incarnation are dropped by [`PersistentStream::accepts`].

use crate::config::EngineConfig;
use crate::queue::{AsyncQueue, TimerId};
use crate::remote::backoff::ExponentialBackoff;
use crate::remote::connection::{Connection, StreamEventSender, StreamHandle, StreamRequest, StreamSink};
use crate::remote::credentials::CredentialsProvider;
use bytes::Bytes;
use docsync_model::{Mutation, MutationResult, SnapshotVersion, TargetData, TargetId};
use docsync_protocol::{Code, ListenRequest, RpcStatus, WatchTarget, WriteRequest, WriteResponse};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lifecycle states of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not started, or stopped cleanly. `start` opens it.
    Initial,
    /// Waiting for the transport to report the stream ready.
    Starting,
    /// Ready for traffic.
    Open,
    /// Closed by a failure; the next `start` backs off first.
    Error,
    /// Waiting for the backoff timer before reopening.
    Backoff,
}

/// The transport side of a stream, generic over its request type.
pub struct PersistentStream<R: StreamRequest> {
    state: StreamState,
    close_count: u64,
    idle_timer: TimerId,
    idle_timeout: Duration,
    backoff: ExponentialBackoff,
    handle: Option<Box<dyn StreamHandle<R>>>,
    connection: Arc<dyn Connection>,
    credentials: Arc<dyn CredentialsProvider>,
    events: StreamEventSender,
}

impl<R: StreamRequest> PersistentStream<R> {
    /// Creates a stream in the `Initial` state.
    pub fn new(
        idle_timer: TimerId,
        backoff_timer: TimerId,
        config: &EngineConfig,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        events: StreamEventSender,
    ) -> Self {
        Self {
            state: StreamState::Initial,
            close_count: 0,
            idle_timer,
            idle_timeout: config.idle_timeout,
            backoff: ExponentialBackoff::new(backoff_timer, config.backoff.clone()),
            handle: None,
            connection,
            credentials,
            events,
        }
    }

    /// The current state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The current close generation.
    pub fn generation(&self) -> u64 {
        self.close_count
    }

    /// True while starting, open or backing off.
    pub fn is_started(&self) -> bool {
        matches!(self.state, StreamState::Starting | StreamState::Open | StreamState::Backoff)
    }

    /// True once the transport reported the stream ready.
    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    /// True if an event from `generation` belongs to the live stream.
    pub fn accepts(&self, generation: u64) -> bool {
        generation == self.close_count && self.handle.is_some()
    }

    /// Opens the stream, or schedules a backoff if the last close was an
    /// error.
    ///
    /// Returns the failure status if the stream could not be opened; the
    /// stream is then closed in the `Error` state and the owner must run its
    /// close handling.
    pub fn start(&mut self, queue: &mut AsyncQueue) -> Result<(), RpcStatus> {
        if self.state == StreamState::Error {
            self.perform_backoff(queue);
            return Ok(());
        }
        assert_eq!(self.state, StreamState::Initial, "{} stream already started", R::KIND);

        self.state = StreamState::Starting;
        let token = match self.credentials.get_token() {
            Ok(token) => token,
            Err(err) => return Err(self.fail(queue, err.to_status())),
        };
        let sink = StreamSink::new(R::KIND, self.close_count, self.events.clone());
        match R::open(self.connection.as_ref(), token.as_ref(), sink) {
            Ok(handle) => {
                debug!(stream = %R::KIND, generation = self.close_count, "stream starting");
                self.handle = Some(handle);
                Ok(())
            }
            Err(err) => Err(self.fail(queue, err.to_status())),
        }
    }

    /// Handles the transport's ready signal. Returns false for stale events.
    pub fn handle_open(&mut self, generation: u64) -> bool {
        if !self.accepts(generation) || self.state != StreamState::Starting {
            return false;
        }
        debug!(stream = %R::KIND, "stream open");
        self.state = StreamState::Open;
        true
    }

    /// Handles a transport close. Returns false for stale events.
    ///
    /// `farewell` is sent before the handle is released.
    pub fn handle_close(
        &mut self,
        queue: &mut AsyncQueue,
        generation: u64,
        status: &RpcStatus,
        farewell: Option<R>,
    ) -> bool {
        if !self.accepts(generation) {
            return false;
        }
        debug!(stream = %R::KIND, %status, "stream closed by transport");
        self.close(queue, StreamState::Error, Some(status), farewell);
        true
    }

    /// Fires when the backoff timer elapses. Returns the failure status if
    /// reopening failed.
    pub fn handle_backoff_elapsed(&mut self, queue: &mut AsyncQueue) -> Result<(), RpcStatus> {
        if self.state != StreamState::Backoff {
            return Ok(());
        }
        self.backoff.mark_attempt(queue);
        self.state = StreamState::Initial;
        self.start(queue)
    }

    /// Fires when the idle timer elapses. Returns true if the stream closed.
    pub fn handle_idle_timeout(&mut self, queue: &mut AsyncQueue, farewell: Option<R>) -> bool {
        if !self.is_open() {
            return false;
        }
        debug!(stream = %R::KIND, "closing idle stream");
        self.close(queue, StreamState::Initial, None, farewell);
        true
    }

    /// Closes the stream without scheduling a reconnect. Returns true if it
    /// was started.
    pub fn stop(&mut self, queue: &mut AsyncQueue, farewell: Option<R>) -> bool {
        if !self.is_started() {
            return false;
        }
        self.close(queue, StreamState::Initial, None, farewell);
        true
    }

    /// After a permanent error, lets the next start skip the backoff.
    pub fn inhibit_backoff(&mut self) {
        assert!(!self.is_started(), "can only inhibit backoff on a stopped stream");
        self.state = StreamState::Initial;
        self.backoff.reset();
    }

    /// Arms the idle timer if the stream is open and the timer is not set.
    pub fn mark_idle(&mut self, queue: &mut AsyncQueue) {
        if self.is_open() && !queue.contains_delayed_operation(self.idle_timer) {
            queue.enqueue_after_delay(self.idle_timer, self.idle_timeout);
        }
    }

    /// Resets reconnection backoff after healthy traffic.
    pub fn reset_backoff(&mut self) {
        self.backoff.reset();
    }

    /// Sends a request, cancelling the idle timer.
    pub fn send(&mut self, queue: &mut AsyncQueue, request: R) {
        queue.cancel(self.idle_timer);
        match self.handle.as_mut() {
            Some(handle) => handle.send(request),
            None => warn!(stream = %R::KIND, ?request, "dropping request on a closed stream"),
        }
    }

    fn perform_backoff(&mut self, queue: &mut AsyncQueue) {
        assert_eq!(self.state, StreamState::Error, "backoff from a healthy stream");
        self.state = StreamState::Backoff;
        self.backoff.backoff_and_run(queue);
    }

    fn fail(&mut self, queue: &mut AsyncQueue, status: RpcStatus) -> RpcStatus {
        warn!(stream = %R::KIND, %status, "stream failed to start");
        self.close(queue, StreamState::Error, Some(&status), None);
        status
    }

    fn close(
        &mut self,
        queue: &mut AsyncQueue,
        final_state: StreamState,
        status: Option<&RpcStatus>,
        farewell: Option<R>,
    ) {
        assert!(
            final_state == StreamState::Error || status.is_none(),
            "a clean close carries no error"
        );
        queue.cancel(self.idle_timer);
        self.backoff.cancel(queue);
        self.close_count += 1;

        if final_state != StreamState::Error {
            self.backoff.reset();
        } else if let Some(status) = status {
            match status.code {
                Code::ResourceExhausted => {
                    warn!(stream = %R::KIND, "backend quota exhausted, using maximum backoff");
                    self.backoff.reset_to_max();
                }
                Code::Unauthenticated => self.credentials.invalidate_token(),
                _ => {}
            }
        }

        if let Some(mut handle) = self.handle.take() {
            if let Some(request) = farewell {
                handle.send(request);
            }
            handle.close();
        }
        self.state = final_state;
    }
}

impl<R: StreamRequest> fmt::Debug for PersistentStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStream")
            .field("kind", &R::KIND)
            .field("state", &self.state)
            .field("close_count", &self.close_count)
            .finish_non_exhaustive()
    }
}

/// The watch stream: adds and removes targets.
#[derive(Debug)]
pub struct WatchStream {
    stream: PersistentStream<ListenRequest>,
}

impl WatchStream {
    /// Wraps a persistent stream.
    pub fn new(stream: PersistentStream<ListenRequest>) -> Self {
        Self { stream }
    }

    /// The underlying stream.
    pub fn stream(&self) -> &PersistentStream<ListenRequest> {
        &self.stream
    }

    /// The underlying stream, mutably.
    pub fn stream_mut(&mut self) -> &mut PersistentStream<ListenRequest> {
        &mut self.stream
    }

    /// Accepts a watch message. Healthy traffic resets backoff.
    pub fn accept_message(&mut self, generation: u64) -> bool {
        if !self.stream.accepts(generation) || !self.stream.is_open() {
            return false;
        }
        self.stream.reset_backoff();
        true
    }

    /// Starts listening to a target.
    pub fn watch(&mut self, queue: &mut AsyncQueue, target_data: &TargetData) {
        self.stream
            .send(queue, ListenRequest::AddTarget(WatchTarget::from_target_data(target_data)));
    }

    /// Stops listening to a target.
    pub fn unwatch(&mut self, queue: &mut AsyncQueue, target_id: TargetId) {
        self.stream.send(queue, ListenRequest::RemoveTarget(target_id));
    }
}

/// What a write stream response meant.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteStreamResponse {
    /// The handshake completed.
    HandshakeComplete,
    /// The oldest in-flight batch committed.
    MutationResults {
        /// Commit version of the batch.
        commit_version: SnapshotVersion,
        /// One result per mutation.
        results: Vec<MutationResult>,
    },
}

/// The write stream: a handshake followed by mutation batches.
#[derive(Debug)]
pub struct WriteStream {
    stream: PersistentStream<WriteRequest>,
    handshake_complete: bool,
    last_stream_token: Bytes,
}

impl WriteStream {
    /// Wraps a persistent stream.
    pub fn new(stream: PersistentStream<WriteRequest>) -> Self {
        Self {
            stream,
            handshake_complete: false,
            last_stream_token: Bytes::new(),
        }
    }

    /// The underlying stream.
    pub fn stream(&self) -> &PersistentStream<WriteRequest> {
        &self.stream
    }

    /// The underlying stream, mutably.
    pub fn stream_mut(&mut self) -> &mut PersistentStream<WriteRequest> {
        &mut self.stream
    }

    /// True once the backend acknowledged the handshake.
    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    /// Token of the latest response.
    pub fn last_stream_token(&self) -> &Bytes {
        &self.last_stream_token
    }

    /// Replaces the stream token.
    pub fn set_last_stream_token(&mut self, token: Bytes) {
        self.last_stream_token = token;
    }

    /// Starts the stream; the handshake must be redone.
    pub fn start(&mut self, queue: &mut AsyncQueue) -> Result<(), RpcStatus> {
        self.handshake_complete = false;
        self.stream.start(queue)
    }

    /// Fires when the backoff timer elapses; a reopened stream must redo the
    /// handshake.
    pub fn handle_backoff_elapsed(&mut self, queue: &mut AsyncQueue) -> Result<(), RpcStatus> {
        if self.stream.state() == StreamState::Backoff {
            self.handshake_complete = false;
        }
        self.stream.handle_backoff_elapsed(queue)
    }

    /// The message sent on close: an empty batch once the handshake is done.
    pub fn farewell(&self) -> Option<WriteRequest> {
        self.handshake_complete.then(|| WriteRequest::Mutations {
            stream_token: self.last_stream_token.clone(),
            writes: Vec::new(),
        })
    }

    /// Sends the handshake.
    pub fn write_handshake(&mut self, queue: &mut AsyncQueue) {
        assert!(self.stream.is_open(), "handshake on a stream that is not open");
        assert!(!self.handshake_complete, "handshake already completed");
        let request = WriteRequest::Handshake {
            stream_token: self.last_stream_token.clone(),
        };
        self.stream.send(queue, request);
    }

    /// Sends one batch of mutations.
    pub fn write_mutations(&mut self, queue: &mut AsyncQueue, mutations: Vec<Mutation>) {
        assert!(self.stream.is_open(), "writing on a stream that is not open");
        assert!(self.handshake_complete, "writing before the handshake completed");
        let request = WriteRequest::Mutations {
            stream_token: self.last_stream_token.clone(),
            writes: mutations,
        };
        self.stream.send(queue, request);
    }

    /// Interprets a response from the live stream. Returns `None` for stale
    /// responses.
    pub fn accept_response(&mut self, generation: u64, response: WriteResponse) -> Option<WriteStreamResponse> {
        if !self.stream.accepts(generation) || !self.stream.is_open() {
            return None;
        }
        self.last_stream_token = response.stream_token;
        if !self.handshake_complete {
            assert!(
                response.write_results.is_empty(),
                "the handshake response carries no results"
            );
            self.handshake_complete = true;
            return Some(WriteStreamResponse::HandshakeComplete);
        }

        self.stream.reset_backoff();
        let commit_version = response.commit_time.unwrap_or(SnapshotVersion::MIN);
        let results = response
            .write_results
            .into_iter()
            .map(|result| {
                MutationResult::new(result.update_time.unwrap_or(commit_version), result.transform_results)
            })
            .collect();
        Some(WriteStreamResponse::MutationResults {
            commit_version,
            results,
        })
    }
}
