//! In-memory remote document cache.

use crate::error::{StorageError, StorageResult};
use crate::index_manager::IndexManager;
use crate::persistence::Transaction;
use crate::remote_document_cache::{NullableMaybeDocumentMap, RemoteDocumentCache, RemoteDocumentChangeBuffer};
use docsync_model::{DocumentKey, DocumentKeySet, DocumentMap, MaybeDocument, Query, SnapshotVersion, SortedMap};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Entry {
    doc: MaybeDocument,
    read_time: SnapshotVersion,
}

/// Remote documents held in an ordered map.
pub struct MemoryRemoteDocumentCache {
    docs: RwLock<BTreeMap<DocumentKey, Entry>>,
    index_manager: Arc<dyn IndexManager>,
}

impl MemoryRemoteDocumentCache {
    /// Creates an empty cache.
    pub fn new(index_manager: Arc<dyn IndexManager>) -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            index_manager,
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    pub(crate) fn remove(&self, key: &DocumentKey) {
        self.docs.write().remove(key);
    }
}

impl std::fmt::Debug for MemoryRemoteDocumentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemoteDocumentCache")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl RemoteDocumentCache for MemoryRemoteDocumentCache {
    fn add_entry(&self, txn: &Transaction, doc: MaybeDocument, read_time: SnapshotVersion) -> StorageResult<()> {
        let collection_path = doc.key().collection_path();
        self.docs.write().insert(doc.key().clone(), Entry { doc, read_time });
        self.index_manager.add_to_collection_parent_index(txn, &collection_path)
    }

    fn remove_entry(&self, _txn: &Transaction, key: &DocumentKey) -> StorageResult<()> {
        self.remove(key);
        Ok(())
    }

    fn get_entry(&self, _txn: &Transaction, key: &DocumentKey) -> StorageResult<Option<MaybeDocument>> {
        Ok(self.docs.read().get(key).map(|entry| entry.doc.clone()))
    }

    fn get_entries(&self, _txn: &Transaction, keys: &DocumentKeySet) -> StorageResult<NullableMaybeDocumentMap> {
        let docs = self.docs.read();
        Ok(keys.iter().fold(SortedMap::new(), |results, key| {
            results.insert(key.clone(), docs.get(key).map(|entry| entry.doc.clone()))
        }))
    }

    fn get_documents_matching_query(
        &self,
        _txn: &Transaction,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> StorageResult<DocumentMap> {
        if query.is_collection_group_query() {
            return Err(StorageError::invalid_operation(
                "collection group queries must be resolved per collection",
            ));
        }
        let prefix = query.path();
        let docs = self.docs.read();
        let mut results = DocumentMap::new();
        for (key, entry) in docs
            .iter()
            .skip_while(|(key, _)| key.path() < prefix)
            .take_while(|(key, _)| prefix.is_prefix_of(key.path()))
        {
            if !prefix.is_immediate_parent_of(key.path()) || entry.read_time <= since_read_time {
                continue;
            }
            if let Some(doc) = entry.doc.as_document() {
                if query.matches(doc) {
                    results = results.insert(key.clone(), doc.clone());
                }
            }
        }
        Ok(results)
    }

    fn new_change_buffer(self: Arc<Self>) -> RemoteDocumentChangeBuffer {
        RemoteDocumentChangeBuffer::new(self)
    }
}
