//! In-memory collection parent index.

use crate::error::StorageResult;
use crate::index_manager::IndexManager;
use crate::persistence::Transaction;
use docsync_model::ResourcePath;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

/// Collection parent index held in a hash map.
#[derive(Debug, Default)]
pub struct MemoryIndexManager {
    parents: RwLock<HashMap<String, BTreeSet<ResourcePath>>>,
}

impl MemoryIndexManager {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexManager for MemoryIndexManager {
    fn add_to_collection_parent_index(&self, _txn: &Transaction, collection_path: &ResourcePath) -> StorageResult<()> {
        let Some(collection_id) = collection_path.last_segment() else {
            return Ok(());
        };
        self.parents
            .write()
            .entry(collection_id.to_string())
            .or_default()
            .insert(collection_path.pop_last());
        Ok(())
    }

    fn get_collection_parents(&self, _txn: &Transaction, collection_id: &str) -> StorageResult<Vec<ResourcePath>> {
        Ok(self
            .parents
            .read()
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::ListenSequenceNumber;

    fn path(s: &str) -> ResourcePath {
        ResourcePath::from_string(s).unwrap()
    }

    #[test]
    fn collects_parents_per_collection_id() {
        let txn = Transaction::new("test", ListenSequenceNumber::new(1));
        let index = MemoryIndexManager::new();
        index.add_to_collection_parent_index(&txn, &path("messages")).unwrap();
        index.add_to_collection_parent_index(&txn, &path("rooms/a/messages")).unwrap();
        index.add_to_collection_parent_index(&txn, &path("rooms/a/messages")).unwrap();
        index.add_to_collection_parent_index(&txn, &path("rooms")).unwrap();

        let parents = index.get_collection_parents(&txn, "messages").unwrap();
        assert_eq!(parents, vec![ResourcePath::empty(), path("rooms/a")]);
        assert!(index.get_collection_parents(&txn, "users").unwrap().is_empty());
    }
}
