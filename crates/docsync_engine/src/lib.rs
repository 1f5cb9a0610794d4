//! # docsync Engine
//!
//! Client-side synchronization core for docsync.
//!
//! This crate provides:
//! - Local store coordinating the mutation queue, remote document cache and
//!   target cache
//! - Index-free query engine that reuses previous target results
//! - Watch and write streams with idle timeouts and exponential backoff
//! - Aggregation of watch changes into consistent remote events
//! - Query views with limbo document resolution
//! - Sync engine tying local writes, remote events and listeners together
//! - Tokio client actor driving the engine in real time
//!
//! ## Architecture
//!
//! The engine is sans-IO. [`SyncEngine`] owns a virtual-clock [`AsyncQueue`]
//! and talks to the backend through a [`Connection`]; transport callbacks
//! come back as [`StreamEvent`]s the caller feeds in. Tests drive the clock
//! and the transport by hand. [`Client`] does the same on a tokio task.
//!
//! ## Key Invariants
//!
//! - Listeners never see a document revert to an older version
//! - A write is visible to listeners before its completion resolves
//! - Remote events are applied only at consistent global snapshots
//! - Unacknowledged writes are resent, in order, after every reconnect
//! - Stale stream callbacks are ignored

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod core;
mod error;
mod local;
mod queue;
mod remote;

pub use client::{Client, QuerySubscription};
pub use config::{BackoffConfig, EngineConfig};
pub use crate::core::{
    ChangeType, ClientId, DocumentChangeSet, DocumentViewChange, EventManager, LimboDocumentChange, ListenOptions,
    ListenerId, MemorySharedClientState, MutationBatchState, QueryListener, QueryObserver, QueryTargetState,
    SharedClientState, SyncCore, SyncEngine, SyncEngineEvent, SyncState, View, ViewChange, ViewDocumentChanges,
    ViewSnapshot, WriteCallback,
};
pub use error::{EngineError, EngineResult};
pub use local::{
    IndexFreeQueryEngine, LocalDocumentsView, LocalStore, LocalViewChanges, LocalWriteResult, QueryEngine, QueryResult,
    UserChangeResult,
};
pub use queue::{AsyncQueue, TimerId};
pub use remote::{
    stream_event_channel, Connection, CredentialsProvider, DocumentWatchChange, EmptyCredentialsProvider,
    ExistenceFilterChange, ExponentialBackoff, MockConnection, OfflineCause, OnlineState, OnlineStateTracker,
    PersistentStream, RemoteEvent, RemoteStore, RemoteSyncer, StreamEvent, StreamEventReceiver, StreamEventSender,
    StreamHandle, StreamKind, StreamPayload, StreamRequest, StreamSink, StreamState, TargetChange,
    TargetMetadataProvider, Token, WatchChange, WatchChangeAggregator, WatchStream, WatchTargetChange, WriteStream,
    WriteStreamResponse,
};
