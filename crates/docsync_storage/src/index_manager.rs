//! Collection parent index used to answer collection group queries.

use crate::error::StorageResult;
use crate::persistence::Transaction;
use docsync_model::ResourcePath;

/// Tracks the parent paths of every collection id seen.
pub trait IndexManager: Send + Sync {
    /// Records a collection path; the last segment is the collection id.
    fn add_to_collection_parent_index(&self, txn: &Transaction, collection_path: &ResourcePath) -> StorageResult<()>;

    /// The parent paths of every collection named `collection_id`.
    fn get_collection_parents(&self, txn: &Transaction, collection_id: &str) -> StorageResult<Vec<ResourcePath>>;
}
