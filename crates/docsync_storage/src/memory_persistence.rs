//! In-memory persistence with eager garbage collection.

use crate::error::{StorageError, StorageResult};
use crate::index_manager::IndexManager;
use crate::memory_index_manager::MemoryIndexManager;
use crate::memory_mutation_queue::MemoryMutationQueue;
use crate::memory_remote_document_cache::MemoryRemoteDocumentCache;
use crate::memory_target_cache::MemoryTargetCache;
use crate::mutation_queue::MutationQueue;
use crate::persistence::{Persistence, ReferenceDelegate, Transaction};
use crate::reference_set::ReferenceSet;
use crate::remote_document_cache::RemoteDocumentCache;
use crate::target_cache::TargetCache;
use docsync_model::{DocumentKey, ListenSequenceNumber, TargetData, User};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type QueueMap = RwLock<HashMap<User, Arc<MemoryMutationQueue>>>;

/// Removes documents from the remote cache as soon as nothing references
/// them.
///
/// Candidates collected during a transaction are checked when it commits.
pub struct MemoryEagerDelegate {
    target_cache: Arc<MemoryTargetCache>,
    remote_documents: Arc<MemoryRemoteDocumentCache>,
    mutation_queues: Arc<QueueMap>,
    pins: RwLock<Option<Arc<RwLock<ReferenceSet>>>>,
    orphaned: Mutex<BTreeSet<DocumentKey>>,
}

impl MemoryEagerDelegate {
    fn is_referenced(&self, key: &DocumentKey) -> bool {
        if self.target_cache.has_key(key) {
            return true;
        }
        if self.mutation_queues.read().values().any(|queue| queue.has_key(key)) {
            return true;
        }
        self.pins
            .read()
            .as_ref()
            .is_some_and(|pins| pins.read().contains_key(key))
    }
}

impl ReferenceDelegate for MemoryEagerDelegate {
    fn set_in_memory_pins(&self, pins: Arc<RwLock<ReferenceSet>>) {
        *self.pins.write() = Some(pins);
    }

    fn add_reference(&self, _txn: &Transaction, key: &DocumentKey) -> StorageResult<()> {
        self.orphaned.lock().remove(key);
        Ok(())
    }

    fn remove_reference(&self, _txn: &Transaction, key: &DocumentKey) -> StorageResult<()> {
        self.orphaned.lock().insert(key.clone());
        Ok(())
    }

    fn mark_potentially_orphaned(&self, _txn: &Transaction, key: &DocumentKey) -> StorageResult<()> {
        self.orphaned.lock().insert(key.clone());
        Ok(())
    }

    fn remove_target(&self, txn: &Transaction, target_data: &TargetData) -> StorageResult<()> {
        let keys = self
            .target_cache
            .get_matching_keys_for_target_id(txn, target_data.target_id)?;
        self.orphaned.lock().extend(keys.iter().cloned());
        self.target_cache.remove_target_data(txn, target_data)
    }

    fn update_limbo_document(&self, _txn: &Transaction, key: &DocumentKey) -> StorageResult<()> {
        if self.is_referenced(key) {
            self.orphaned.lock().remove(key);
        } else {
            self.orphaned.lock().insert(key.clone());
        }
        Ok(())
    }

    fn on_transaction_started(&self) {
        self.orphaned.lock().clear();
    }

    fn on_transaction_committed(&self, txn: &Transaction) -> StorageResult<()> {
        let candidates = std::mem::take(&mut *self.orphaned.lock());
        let mut collected = 0usize;
        for key in candidates {
            if !self.is_referenced(&key) {
                self.remote_documents.remove_entry(txn, &key)?;
                collected += 1;
            }
        }
        if collected > 0 {
            tracing::trace!(collected, action = txn.action(), "collected orphaned documents");
        }
        Ok(())
    }
}

/// Persistence kept entirely in memory.
///
/// Storage can be flagged unavailable to exercise the network layer's
/// offline handling; while unavailable every transaction fails with
/// [`StorageError::Unavailable`].
pub struct MemoryPersistence {
    started: AtomicBool,
    available: AtomicBool,
    sequence_number: Mutex<ListenSequenceNumber>,
    index_manager: Arc<MemoryIndexManager>,
    remote_documents: Arc<MemoryRemoteDocumentCache>,
    target_cache: Arc<MemoryTargetCache>,
    mutation_queues: Arc<QueueMap>,
    delegate: Arc<MemoryEagerDelegate>,
}

impl MemoryPersistence {
    /// Creates persistence with eager garbage collection.
    #[must_use]
    pub fn new() -> Self {
        let index_manager = Arc::new(MemoryIndexManager::new());
        let remote_documents = Arc::new(MemoryRemoteDocumentCache::new(index_manager.clone()));
        let mutation_queues: Arc<QueueMap> = Arc::new(RwLock::new(HashMap::new()));
        let delegate = Arc::new_cyclic(|weak: &Weak<MemoryEagerDelegate>| {
            let weak: Weak<dyn ReferenceDelegate> = weak.clone();
            MemoryEagerDelegate {
                target_cache: Arc::new(MemoryTargetCache::new(weak)),
                remote_documents: remote_documents.clone(),
                mutation_queues: mutation_queues.clone(),
                pins: RwLock::new(None),
                orphaned: Mutex::new(BTreeSet::new()),
            }
        });
        Self {
            started: AtomicBool::new(false),
            available: AtomicBool::new(true),
            sequence_number: Mutex::new(ListenSequenceNumber::new(0)),
            index_manager,
            remote_documents,
            target_cache: delegate.target_cache.clone(),
            mutation_queues,
            delegate,
        }
    }

    /// Toggles simulated storage availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// The concrete remote document cache, for inspection in tests.
    pub fn memory_remote_documents(&self) -> &Arc<MemoryRemoteDocumentCache> {
        &self.remote_documents
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPersistence")
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("available", &self.available.load(Ordering::SeqCst))
            .field("sequence_number", &*self.sequence_number.lock())
            .finish_non_exhaustive()
    }
}

impl Persistence for MemoryPersistence {
    fn start(&self) -> StorageResult<()> {
        self.started.store(true, Ordering::SeqCst);
        tracing::debug!("memory persistence started");
        Ok(())
    }

    fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        tracing::debug!("memory persistence shut down");
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn mutation_queue(&self, user: &User) -> Arc<dyn MutationQueue> {
        if let Some(queue) = self.mutation_queues.read().get(user) {
            return queue.clone();
        }
        let weak = Arc::downgrade(&self.delegate);
        let delegate: Weak<dyn ReferenceDelegate> = weak;
        self.mutation_queues
            .write()
            .entry(user.clone())
            .or_insert_with(|| Arc::new(MemoryMutationQueue::new(self.index_manager.clone(), delegate)))
            .clone()
    }

    fn target_cache(&self) -> Arc<dyn TargetCache> {
        self.target_cache.clone()
    }

    fn remote_document_cache(&self) -> Arc<dyn RemoteDocumentCache> {
        self.remote_documents.clone()
    }

    fn index_manager(&self) -> Arc<dyn IndexManager> {
        self.index_manager.clone()
    }

    fn reference_delegate(&self) -> Arc<dyn ReferenceDelegate> {
        self.delegate.clone()
    }

    fn begin_transaction(&self, action: &str) -> StorageResult<Transaction> {
        if !self.is_started() {
            return Err(StorageError::Closed);
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(format!("simulated outage during '{action}'")));
        }
        let sequence_number = {
            let mut current = self.sequence_number.lock();
            *current = current.next();
            *current
        };
        self.delegate.on_transaction_started();
        Ok(Transaction::new(action, sequence_number))
    }

    fn commit_transaction(&self, txn: &Transaction) -> StorageResult<()> {
        self.delegate.on_transaction_committed(txn)
    }
}
