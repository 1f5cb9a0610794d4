//! Transport abstraction for the watch and write streams.
//!
//! A [`Connection`] opens bidirectional streams. Outbound messages go through
//! the returned [`StreamHandle`]; everything the transport observes (the
//! stream becoming ready, inbound messages, closure) is reported through a
//! [`StreamSink`] as a [`StreamEvent`] tagged with the stream kind and the
//! close generation it was opened under.

use crate::error::{EngineError, EngineResult};
use crate::remote::credentials::Token;
use docsync_protocol::{ListenRequest, ListenResponse, RpcStatus, WriteRequest, WriteResponse};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which of the two streams an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// The listen stream carrying target changes.
    Watch,
    /// The stream carrying mutation batches.
    Write,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Watch => f.write_str("watch"),
            StreamKind::Write => f.write_str("write"),
        }
    }
}

/// What the transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPayload {
    /// The stream is ready for traffic.
    Open,
    /// A message arrived on the watch stream.
    ListenMessage(ListenResponse),
    /// A message arrived on the write stream.
    WriteMessage(WriteResponse),
    /// The stream closed with an error.
    Close(RpcStatus),
}

/// A transport observation delivered to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    /// The stream.
    pub kind: StreamKind,
    /// Close generation the stream was opened under.
    pub generation: u64,
    /// What happened.
    pub payload: StreamPayload,
}

/// Sending half of the engine's stream event channel.
pub type StreamEventSender = mpsc::UnboundedSender<StreamEvent>;

/// Receiving half of the engine's stream event channel.
pub type StreamEventReceiver = mpsc::UnboundedReceiver<StreamEvent>;

/// Creates the channel transports report into.
pub fn stream_event_channel() -> (StreamEventSender, StreamEventReceiver) {
    mpsc::unbounded_channel()
}

/// Reports transport observations for one opened stream.
#[derive(Debug, Clone)]
pub struct StreamSink {
    kind: StreamKind,
    generation: u64,
    tx: StreamEventSender,
}

impl StreamSink {
    /// Creates a sink for a stream opened under `generation`.
    pub fn new(kind: StreamKind, generation: u64, tx: StreamEventSender) -> Self {
        Self { kind, generation, tx }
    }

    /// The stream kind.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// The close generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reports that the stream is ready.
    pub fn on_open(&self) {
        self.emit(StreamPayload::Open);
    }

    /// Reports a watch message.
    pub fn on_listen_message(&self, message: ListenResponse) {
        self.emit(StreamPayload::ListenMessage(message));
    }

    /// Reports a write message.
    pub fn on_write_message(&self, message: WriteResponse) {
        self.emit(StreamPayload::WriteMessage(message));
    }

    /// Reports that the stream closed.
    pub fn on_close(&self, status: RpcStatus) {
        self.emit(StreamPayload::Close(status));
    }

    fn emit(&self, payload: StreamPayload) {
        // A dropped receiver means the engine is gone; nothing to notify.
        let _ = self.tx.send(StreamEvent {
            kind: self.kind,
            generation: self.generation,
            payload,
        });
    }
}

/// Outbound half of an opened stream.
pub trait StreamHandle<R>: Send {
    /// Sends a request.
    fn send(&mut self, request: R);

    /// Closes the stream. No events are expected afterwards.
    fn close(&mut self);
}

/// Opens streams to the backend.
pub trait Connection: Send + Sync {
    /// Opens a watch stream.
    fn open_listen_stream(
        &self,
        token: Option<&Token>,
        sink: StreamSink,
    ) -> EngineResult<Box<dyn StreamHandle<ListenRequest>>>;

    /// Opens a write stream.
    fn open_write_stream(&self, token: Option<&Token>, sink: StreamSink)
        -> EngineResult<Box<dyn StreamHandle<WriteRequest>>>;
}

/// A request type that selects its stream.
pub trait StreamRequest: fmt::Debug + Send + Sized + 'static {
    /// The stream the request is sent on.
    const KIND: StreamKind;

    /// Opens a stream for this request type.
    fn open(connection: &dyn Connection, token: Option<&Token>, sink: StreamSink)
        -> EngineResult<Box<dyn StreamHandle<Self>>>;
}

impl StreamRequest for ListenRequest {
    const KIND: StreamKind = StreamKind::Watch;

    fn open(
        connection: &dyn Connection,
        token: Option<&Token>,
        sink: StreamSink,
    ) -> EngineResult<Box<dyn StreamHandle<Self>>> {
        connection.open_listen_stream(token, sink)
    }
}

impl StreamRequest for WriteRequest {
    const KIND: StreamKind = StreamKind::Write;

    fn open(
        connection: &dyn Connection,
        token: Option<&Token>,
        sink: StreamSink,
    ) -> EngineResult<Box<dyn StreamHandle<Self>>> {
        connection.open_write_stream(token, sink)
    }
}

/// One stream opened on a [`MockConnection`].
struct MockStream<R> {
    sink: StreamSink,
    token: Option<Token>,
    sent: Arc<Mutex<Vec<R>>>,
    closed: Arc<AtomicBool>,
}

struct MockHandle<R> {
    sent: Arc<Mutex<Vec<R>>>,
    closed: Arc<AtomicBool>,
}

impl<R: Send> StreamHandle<R> for MockHandle<R> {
    fn send(&mut self, request: R) {
        assert!(!self.closed.load(Ordering::SeqCst), "send on a closed mock stream");
        self.sent.lock().push(request);
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockState {
    listen: Vec<MockStream<ListenRequest>>,
    write: Vec<MockStream<WriteRequest>>,
    fail_next_open: Option<EngineError>,
}

/// In-memory connection for tests.
///
/// Records every opened stream and the requests sent on it; tests play the
/// backend by reporting events through the most recent stream's sink.
#[derive(Default)]
pub struct MockConnection {
    state: Mutex<MockState>,
}

impl MockConnection {
    /// Creates a connection with no streams.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next open of either stream fail with `error`.
    pub fn fail_next_open(&self, error: EngineError) {
        self.state.lock().fail_next_open = Some(error);
    }

    /// Number of watch streams opened so far.
    pub fn listen_stream_count(&self) -> usize {
        self.state.lock().listen.len()
    }

    /// Number of write streams opened so far.
    pub fn write_stream_count(&self) -> usize {
        self.state.lock().write.len()
    }

    /// Sink of the latest watch stream.
    pub fn listen_sink(&self) -> Option<StreamSink> {
        self.state.lock().listen.last().map(|s| s.sink.clone())
    }

    /// Sink of the latest write stream.
    pub fn write_sink(&self) -> Option<StreamSink> {
        self.state.lock().write.last().map(|s| s.sink.clone())
    }

    /// Token the latest watch stream was opened with.
    pub fn listen_token(&self) -> Option<Token> {
        self.state.lock().listen.last().and_then(|s| s.token.clone())
    }

    /// Requests sent on the latest watch stream.
    pub fn listen_requests(&self) -> Vec<ListenRequest> {
        self.state
            .lock()
            .listen
            .last()
            .map(|s| s.sent.lock().clone())
            .unwrap_or_default()
    }

    /// Requests sent on the latest write stream.
    pub fn write_requests(&self) -> Vec<WriteRequest> {
        self.state
            .lock()
            .write
            .last()
            .map(|s| s.sent.lock().clone())
            .unwrap_or_default()
    }

    /// True if the latest watch stream exists and the client has not closed it.
    pub fn is_listen_stream_open(&self) -> bool {
        self.state
            .lock()
            .listen
            .last()
            .is_some_and(|s| !s.closed.load(Ordering::SeqCst))
    }

    /// True if the latest write stream exists and the client has not closed it.
    pub fn is_write_stream_open(&self) -> bool {
        self.state
            .lock()
            .write
            .last()
            .is_some_and(|s| !s.closed.load(Ordering::SeqCst))
    }

    fn take_failure(&self) -> EngineResult<()> {
        match self.state.lock().fail_next_open.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockConnection")
            .field("listen_streams", &state.listen.len())
            .field("write_streams", &state.write.len())
            .finish()
    }
}

impl Connection for MockConnection {
    fn open_listen_stream(
        &self,
        token: Option<&Token>,
        sink: StreamSink,
    ) -> EngineResult<Box<dyn StreamHandle<ListenRequest>>> {
        self.take_failure()?;
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        self.state.lock().listen.push(MockStream {
            sink,
            token: token.cloned(),
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        });
        Ok(Box::new(MockHandle { sent, closed }))
    }

    fn open_write_stream(
        &self,
        token: Option<&Token>,
        sink: StreamSink,
    ) -> EngineResult<Box<dyn StreamHandle<WriteRequest>>> {
        self.take_failure()?;
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        self.state.lock().write.push(MockStream {
            sink,
            token: token.cloned(),
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        });
        Ok(Box::new(MockHandle { sent, closed }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::TargetId;
    use docsync_protocol::Code;

    #[test]
    fn sink_tags_events_with_kind_and_generation() {
        let (tx, mut rx) = stream_event_channel();
        let sink = StreamSink::new(StreamKind::Watch, 3, tx);
        sink.on_open();
        sink.on_close(RpcStatus::new(Code::Unavailable, "gone"));

        let open = rx.try_recv().unwrap();
        assert_eq!(open.kind, StreamKind::Watch);
        assert_eq!(open.generation, 3);
        assert_eq!(open.payload, StreamPayload::Open);
        assert!(matches!(rx.try_recv().unwrap().payload, StreamPayload::Close(_)));
    }

    #[test]
    fn mock_connection_records_requests() {
        let (tx, _rx) = stream_event_channel();
        let connection = MockConnection::new();
        let mut handle =
            ListenRequest::open(&connection, None, StreamSink::new(StreamKind::Watch, 0, tx)).unwrap();
        handle.send(ListenRequest::RemoveTarget(TargetId(2)));

        assert_eq!(connection.listen_stream_count(), 1);
        assert_eq!(connection.listen_requests(), vec![ListenRequest::RemoveTarget(TargetId(2))]);
        assert!(connection.is_listen_stream_open());
        handle.close();
        assert!(!connection.is_listen_stream_open());
    }

    #[test]
    fn mock_connection_can_fail_an_open() {
        let (tx, _rx) = stream_event_channel();
        let connection = MockConnection::new();
        connection.fail_next_open(EngineError::rpc(Code::Unavailable, "no route"));
        let result = WriteRequest::open(&connection, None, StreamSink::new(StreamKind::Write, 0, tx));
        assert!(result.is_err());
        assert_eq!(connection.write_stream_count(), 0);
    }
}
