//! The per-user queue of unacknowledged mutation batches.

use crate::error::StorageResult;
use crate::persistence::Transaction;
use bytes::Bytes;
use docsync_model::{BatchId, DocumentKey, DocumentKeySet, Mutation, MutationBatch, Query, Timestamp};

/// Ordered queue of mutation batches written by one user.
///
/// # Invariants
///
/// - Batch ids are strictly increasing
/// - Only the oldest batch can be removed
/// - Batches returned by the `affecting` lookups are ordered by batch id
pub trait MutationQueue: Send + Sync {
    /// True if no batches are queued.
    fn check_empty(&self, txn: &Transaction) -> StorageResult<bool>;

    /// Appends a batch and returns it with its assigned id.
    fn add_mutation_batch(
        &self,
        txn: &Transaction,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> StorageResult<MutationBatch>;

    /// Looks up a batch by id.
    fn lookup_mutation_batch(&self, txn: &Transaction, batch_id: BatchId) -> StorageResult<Option<MutationBatch>>;

    /// Returns the first batch with an id greater than `batch_id`.
    fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &Transaction,
        batch_id: BatchId,
    ) -> StorageResult<Option<MutationBatch>>;

    /// The id of the newest queued batch, or [`BatchId::UNKNOWN`].
    fn get_highest_unacknowledged_batch_id(&self, txn: &Transaction) -> StorageResult<BatchId>;

    /// Every queued batch.
    fn get_all_mutation_batches(&self, txn: &Transaction) -> StorageResult<Vec<MutationBatch>>;

    /// Batches that write `key`.
    fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &Transaction,
        key: &DocumentKey,
    ) -> StorageResult<Vec<MutationBatch>>;

    /// Batches that write any of `keys`.
    fn get_all_mutation_batches_affecting_document_keys(
        &self,
        txn: &Transaction,
        keys: &DocumentKeySet,
    ) -> StorageResult<Vec<MutationBatch>>;

    /// Batches that write documents directly inside the query's collection.
    ///
    /// Collection group queries are resolved by the caller.
    fn get_all_mutation_batches_affecting_query(&self, txn: &Transaction, query: &Query)
        -> StorageResult<Vec<MutationBatch>>;

    /// Removes the oldest batch.
    fn remove_mutation_batch(&self, txn: &Transaction, batch: &MutationBatch) -> StorageResult<()>;

    /// True if any queued batch writes `key`.
    fn contains_key(&self, txn: &Transaction, key: &DocumentKey) -> StorageResult<bool>;

    /// The write stream token of the last acknowledged batch.
    fn get_last_stream_token(&self, txn: &Transaction) -> StorageResult<Bytes>;

    /// Stores the write stream token.
    fn set_last_stream_token(&self, txn: &Transaction, token: Bytes) -> StorageResult<()>;

    /// Verifies internal indexes agree with the queue.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Corrupted`] when they do not.
    fn perform_consistency_check(&self, txn: &Transaction) -> StorageResult<()>;
}
