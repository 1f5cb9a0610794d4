//! Persistence entry point and transactions.

use crate::error::StorageResult;
use crate::index_manager::IndexManager;
use crate::mutation_queue::MutationQueue;
use crate::reference_set::ReferenceSet;
use crate::remote_document_cache::RemoteDocumentCache;
use crate::target_cache::TargetCache;
use docsync_model::{DocumentKey, ListenSequenceNumber, TargetData, User};
use parking_lot::RwLock;
use std::sync::Arc;

/// A unit of work against persistence.
///
/// Every storage call takes the transaction it runs in. The transaction
/// carries the sequence number that reference-counted garbage collection
/// stamps on anything it touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    action: String,
    sequence_number: ListenSequenceNumber,
}

impl Transaction {
    /// Creates a transaction.
    pub fn new(action: impl Into<String>, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            action: action.into(),
            sequence_number,
        }
    }

    /// What the transaction is for; used in logs.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// The sequence number assigned to this transaction.
    pub fn sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }
}

/// Hooks that decide when cached documents may be collected.
///
/// # Invariants
///
/// - A document referenced by a target, a queued mutation or an in-memory
///   pin is never removed
/// - Orphan bookkeeping is scoped to one transaction
pub trait ReferenceDelegate: Send + Sync {
    /// Installs the pins held by active local views.
    fn set_in_memory_pins(&self, pins: Arc<RwLock<ReferenceSet>>);

    /// Notes that a target now references `key`.
    fn add_reference(&self, txn: &Transaction, key: &DocumentKey) -> StorageResult<()>;

    /// Notes that a target no longer references `key`.
    fn remove_reference(&self, txn: &Transaction, key: &DocumentKey) -> StorageResult<()>;

    /// Notes that `key` may have lost its last reference.
    fn mark_potentially_orphaned(&self, txn: &Transaction, key: &DocumentKey) -> StorageResult<()>;

    /// Removes a target and releases its documents.
    fn remove_target(&self, txn: &Transaction, target_data: &TargetData) -> StorageResult<()>;

    /// Re-evaluates a document that only a limbo resolution touched.
    fn update_limbo_document(&self, txn: &Transaction, key: &DocumentKey) -> StorageResult<()>;

    /// Called when a transaction begins.
    fn on_transaction_started(&self);

    /// Called when a transaction commits; collects orphaned documents.
    fn on_transaction_committed(&self, txn: &Transaction) -> StorageResult<()>;
}

/// The storage backend consumed by the local store.
///
/// # Implementors
///
/// - [`crate::MemoryPersistence`] - in-memory reference implementation
pub trait Persistence: Send + Sync {
    /// Starts the persistence layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be opened.
    fn start(&self) -> StorageResult<()>;

    /// Shuts the persistence layer down; later transactions fail.
    fn shutdown(&self);

    /// True between `start` and `shutdown`.
    fn is_started(&self) -> bool;

    /// The mutation queue of `user`.
    fn mutation_queue(&self, user: &User) -> Arc<dyn MutationQueue>;

    /// The target cache.
    fn target_cache(&self) -> Arc<dyn TargetCache>;

    /// The remote document cache.
    fn remote_document_cache(&self) -> Arc<dyn RemoteDocumentCache>;

    /// The collection parent index.
    fn index_manager(&self) -> Arc<dyn IndexManager>;

    /// The garbage collection delegate.
    fn reference_delegate(&self) -> Arc<dyn ReferenceDelegate>;

    /// Opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Unavailable`] when storage cannot be
    /// accessed and [`crate::StorageError::Closed`] after shutdown.
    fn begin_transaction(&self, action: &str) -> StorageResult<Transaction>;

    /// Commits a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit hooks fail.
    fn commit_transaction(&self, txn: &Transaction) -> StorageResult<()>;
}

/// Convenience wrapper running a closure inside a transaction.
pub trait PersistenceExt: Persistence {
    /// Runs `f` in a new transaction and commits it if `f` succeeds.
    ///
    /// Errors are never retried here; they propagate to the caller.
    fn run_transaction<T, F>(&self, action: &str, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Transaction) -> StorageResult<T>,
    {
        let txn = self.begin_transaction(action)?;
        tracing::trace!(action, seq = %txn.sequence_number(), "transaction started");
        let result = f(&txn)?;
        self.commit_transaction(&txn)?;
        Ok(result)
    }
}

impl<P: Persistence + ?Sized> PersistenceExt for P {}
