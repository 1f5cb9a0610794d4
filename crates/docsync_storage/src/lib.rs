//! # docsync Storage
//!
//! Storage SPI for the docsync client and its in-memory implementation.
//!
//! The local store talks to storage only through the traits in this crate.
//! Every call runs inside a [`Transaction`] obtained from a [`Persistence`].
//!
//! This crate provides:
//! - [`MutationQueue`] - per-user queue of unacknowledged write batches
//! - [`RemoteDocumentCache`] - documents as last reported by the backend
//! - [`TargetCache`] - listened targets and their matching keys
//! - [`IndexManager`] - collection parent index for collection groups
//! - [`ReferenceDelegate`] - garbage collection hooks
//! - [`MemoryPersistence`] - all of the above held in memory
//!
//! ## Key Invariants
//!
//! - Mutation batch ids are strictly increasing and only the head batch
//!   can be removed
//! - Target cache ids are even; the last remote snapshot version never
//!   decreases
//! - A cached document is collected only when no target, queued batch or
//!   in-memory pin references it
//!
//! ## Example
//!
//! ```rust
//! use docsync_storage::{MemoryPersistence, Persistence, PersistenceExt};
//! use docsync_model::User;
//!
//! let persistence = MemoryPersistence::new();
//! persistence.start().unwrap();
//! let queue = persistence.mutation_queue(&User::UNAUTHENTICATED);
//! let empty = persistence
//!     .run_transaction("check", |txn| queue.check_empty(txn))
//!     .unwrap();
//! assert!(empty);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod index_manager;
mod memory_index_manager;
mod memory_mutation_queue;
mod memory_persistence;
mod memory_remote_document_cache;
mod memory_target_cache;
mod mutation_queue;
mod persistence;
mod reference_set;
mod remote_document_cache;
mod target_cache;

pub use error::{StorageError, StorageResult};
pub use index_manager::IndexManager;
pub use memory_index_manager::MemoryIndexManager;
pub use memory_mutation_queue::MemoryMutationQueue;
pub use memory_persistence::{MemoryEagerDelegate, MemoryPersistence};
pub use memory_remote_document_cache::MemoryRemoteDocumentCache;
pub use memory_target_cache::MemoryTargetCache;
pub use mutation_queue::MutationQueue;
pub use persistence::{Persistence, PersistenceExt, ReferenceDelegate, Transaction};
pub use reference_set::{DocReference, ReferenceSet};
pub use remote_document_cache::{NullableMaybeDocumentMap, RemoteDocumentCache, RemoteDocumentChangeBuffer};
pub use target_cache::TargetCache;
