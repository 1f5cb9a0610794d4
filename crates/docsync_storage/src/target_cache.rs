//! Cache of listened targets and their matching documents.

use crate::error::StorageResult;
use crate::persistence::Transaction;
use docsync_model::{
    DocumentKey, DocumentKeySet, ListenSequenceNumber, SnapshotVersion, Target, TargetData, TargetId,
};

/// Target metadata plus the target-to-document mapping.
///
/// # Invariants
///
/// - Allocated target ids are even and strictly increasing
/// - The last remote snapshot version never decreases
pub trait TargetCache: Send + Sync {
    /// Allocates a new target id.
    fn allocate_target_id(&self, txn: &Transaction) -> StorageResult<TargetId>;

    /// The version of the last consistent snapshot from the backend.
    fn get_last_remote_snapshot_version(&self, txn: &Transaction) -> StorageResult<SnapshotVersion>;

    /// The highest sequence number used by any transaction.
    fn get_highest_sequence_number(&self, txn: &Transaction) -> StorageResult<ListenSequenceNumber>;

    /// Stores the global metadata.
    fn set_target_and_sequence_metadata(
        &self,
        txn: &Transaction,
        highest_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: SnapshotVersion,
    ) -> StorageResult<()>;

    /// Adds metadata for a new target.
    fn add_target_data(&self, txn: &Transaction, target_data: &TargetData) -> StorageResult<()>;

    /// Replaces metadata for an existing target.
    fn update_target_data(&self, txn: &Transaction, target_data: &TargetData) -> StorageResult<()>;

    /// Removes a target and its matching keys.
    fn remove_target_data(&self, txn: &Transaction, target_data: &TargetData) -> StorageResult<()>;

    /// Number of cached targets.
    fn get_target_count(&self, txn: &Transaction) -> StorageResult<usize>;

    /// Looks up metadata by target.
    fn get_target_data(&self, txn: &Transaction, target: &Target) -> StorageResult<Option<TargetData>>;

    /// Records that `keys` match the target.
    fn add_matching_keys(&self, txn: &Transaction, keys: &DocumentKeySet, target_id: TargetId) -> StorageResult<()>;

    /// Records that `keys` no longer match the target.
    fn remove_matching_keys(&self, txn: &Transaction, keys: &DocumentKeySet, target_id: TargetId)
        -> StorageResult<()>;

    /// Drops every matching key of the target.
    fn remove_matching_keys_for_target_id(&self, txn: &Transaction, target_id: TargetId) -> StorageResult<()>;

    /// The keys matching the target.
    fn get_matching_keys_for_target_id(&self, txn: &Transaction, target_id: TargetId) -> StorageResult<DocumentKeySet>;

    /// True if any target matches `key`.
    fn contains_key(&self, txn: &Transaction, key: &DocumentKey) -> StorageResult<bool>;
}
