//! Remote side of the engine: the watch and write streams, backoff, online
//! state tracking and the aggregation of watch changes into remote events.

mod backoff;
mod connection;
mod credentials;
mod online_state;
mod persistent_stream;
mod remote_event;
mod remote_store;
mod watch_change;

pub use backoff::ExponentialBackoff;
pub use connection::{
    stream_event_channel, Connection, MockConnection, StreamEvent, StreamEventReceiver, StreamEventSender,
    StreamHandle, StreamKind, StreamPayload, StreamRequest, StreamSink,
};
pub use credentials::{CredentialsProvider, EmptyCredentialsProvider, Token};
pub use online_state::{OnlineState, OnlineStateTracker};
pub use persistent_stream::{PersistentStream, StreamState, WatchStream, WriteStream, WriteStreamResponse};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{OfflineCause, RemoteStore, RemoteSyncer};
pub use watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetMetadataProvider, WatchChange, WatchChangeAggregator,
    WatchTargetChange,
};
