//! Cache of documents as last reported by the backend.

use crate::error::StorageResult;
use crate::persistence::Transaction;
use docsync_model::{DocumentKey, DocumentKeySet, DocumentMap, MaybeDocument, Query, SnapshotVersion, SortedMap};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Lookup result for several keys; `None` marks keys with no entry.
pub type NullableMaybeDocumentMap = SortedMap<DocumentKey, Option<MaybeDocument>>;

/// Remote document storage.
///
/// Entries carry the read time they were written at, which lets queries
/// fetch only documents changed since a snapshot.
pub trait RemoteDocumentCache: Send + Sync {
    /// Stores `doc`, read at `read_time`.
    fn add_entry(&self, txn: &Transaction, doc: MaybeDocument, read_time: SnapshotVersion) -> StorageResult<()>;

    /// Removes the entry for `key`.
    fn remove_entry(&self, txn: &Transaction, key: &DocumentKey) -> StorageResult<()>;

    /// Looks up one entry.
    fn get_entry(&self, txn: &Transaction, key: &DocumentKey) -> StorageResult<Option<MaybeDocument>>;

    /// Looks up several entries.
    fn get_entries(&self, txn: &Transaction, keys: &DocumentKeySet) -> StorageResult<NullableMaybeDocumentMap>;

    /// Existing documents directly in the query's collection that match it
    /// and were read after `since_read_time`.
    fn get_documents_matching_query(
        &self,
        txn: &Transaction,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> StorageResult<DocumentMap>;

    /// Opens a buffer that batches writes to this cache.
    fn new_change_buffer(self: Arc<Self>) -> RemoteDocumentChangeBuffer;
}

/// Buffers cache writes and applies them together.
///
/// Reads through the buffer see buffered changes first.
pub struct RemoteDocumentChangeBuffer {
    cache: Arc<dyn RemoteDocumentCache>,
    changes: BTreeMap<DocumentKey, Option<(MaybeDocument, SnapshotVersion)>>,
    applied: bool,
}

impl RemoteDocumentChangeBuffer {
    /// Creates a buffer over `cache`.
    pub fn new(cache: Arc<dyn RemoteDocumentCache>) -> Self {
        Self {
            cache,
            changes: BTreeMap::new(),
            applied: false,
        }
    }

    /// Buffers an entry write.
    pub fn add_entry(&mut self, doc: MaybeDocument, read_time: SnapshotVersion) {
        self.assert_not_applied();
        self.changes.insert(doc.key().clone(), Some((doc, read_time)));
    }

    /// Buffers an entry removal.
    pub fn remove_entry(&mut self, key: &DocumentKey) {
        self.assert_not_applied();
        self.changes.insert(key.clone(), None);
    }

    /// Reads an entry, preferring buffered changes.
    pub fn get_entry(&self, txn: &Transaction, key: &DocumentKey) -> StorageResult<Option<MaybeDocument>> {
        match self.changes.get(key) {
            Some(change) => Ok(change.as_ref().map(|(doc, _)| doc.clone())),
            None => self.cache.get_entry(txn, key),
        }
    }

    /// Reads several entries, preferring buffered changes.
    pub fn get_entries(&self, txn: &Transaction, keys: &DocumentKeySet) -> StorageResult<NullableMaybeDocumentMap> {
        let mut entries = self.cache.get_entries(txn, keys)?;
        for key in keys.iter() {
            if let Some(change) = self.changes.get(key) {
                entries = entries.insert(key.clone(), change.as_ref().map(|(doc, _)| doc.clone()));
            }
        }
        Ok(entries)
    }

    /// Writes every buffered change to the cache.
    pub fn apply(&mut self, txn: &Transaction) -> StorageResult<()> {
        self.assert_not_applied();
        self.applied = true;
        for (key, change) in std::mem::take(&mut self.changes) {
            match change {
                Some((doc, read_time)) => self.cache.add_entry(txn, doc, read_time)?,
                None => self.cache.remove_entry(txn, &key)?,
            }
        }
        Ok(())
    }

    fn assert_not_applied(&self) {
        assert!(!self.applied, "change buffer was already applied");
    }
}
