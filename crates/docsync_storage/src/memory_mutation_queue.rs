//! In-memory mutation queue.

use crate::error::{StorageError, StorageResult};
use crate::index_manager::IndexManager;
use crate::mutation_queue::MutationQueue;
use crate::persistence::{ReferenceDelegate, Transaction};
use crate::reference_set::DocReference;
use bytes::Bytes;
use docsync_model::{BatchId, DocumentKey, DocumentKeySet, Mutation, MutationBatch, Query, SortedSet, Timestamp};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

#[derive(Debug)]
struct QueueState {
    /// Batches in id order. Removal only happens at the head, so a batch's
    /// position is its id minus the id of the first batch.
    queue: Vec<MutationBatch>,
    next_batch_id: BatchId,
    last_stream_token: Bytes,
    /// `(key, batch id)` for every key written by a queued batch.
    batches_by_key: SortedSet<DocReference>,
}

impl QueueState {
    fn index_of_batch_id(&self, batch_id: BatchId) -> i64 {
        match self.queue.first() {
            Some(first) => i64::from(batch_id.as_i32()) - i64::from(first.batch_id.as_i32()),
            None => 0,
        }
    }

    fn batch_at(&self, index: i64) -> Option<&MutationBatch> {
        usize::try_from(index).ok().and_then(|index| self.queue.get(index))
    }

    fn lookup(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batch_at(self.index_of_batch_id(batch_id))
    }

    fn batches_for_ids(&self, ids: BTreeSet<i32>) -> Vec<MutationBatch> {
        ids.into_iter()
            .filter_map(|id| self.lookup(BatchId(id)).cloned())
            .collect()
    }
}

/// Mutation queue of one user, held in memory.
pub struct MemoryMutationQueue {
    state: RwLock<QueueState>,
    index_manager: Arc<dyn IndexManager>,
    delegate: Weak<dyn ReferenceDelegate>,
}

impl MemoryMutationQueue {
    /// Creates an empty queue.
    pub fn new(index_manager: Arc<dyn IndexManager>, delegate: Weak<dyn ReferenceDelegate>) -> Self {
        Self {
            state: RwLock::new(QueueState {
                queue: Vec::new(),
                next_batch_id: BatchId(1),
                last_stream_token: Bytes::new(),
                batches_by_key: SortedSet::new(),
            }),
            index_manager,
            delegate,
        }
    }

    /// True if a queued batch writes `key`; needs no transaction.
    pub(crate) fn has_key(&self, key: &DocumentKey) -> bool {
        self.state
            .read()
            .batches_by_key
            .iter_from(&DocReference::first_for_key(key.clone()))
            .next()
            .is_some_and(|reference| &reference.key == key)
    }
}

impl std::fmt::Debug for MemoryMutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMutationQueue")
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl MutationQueue for MemoryMutationQueue {
    fn check_empty(&self, _txn: &Transaction) -> StorageResult<bool> {
        Ok(self.state.read().queue.is_empty())
    }

    fn add_mutation_batch(
        &self,
        txn: &Transaction,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> StorageResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(StorageError::invalid_operation("mutation batches must not be empty"));
        }
        let batch = {
            let mut state = self.state.write();
            let batch_id = state.next_batch_id;
            state.next_batch_id = batch_id.next();
            if let Some(last) = state.queue.last() {
                if last.batch_id >= batch_id {
                    return Err(StorageError::corrupted(format!(
                        "mutation batch ids must be increasing: {} then {}",
                        last.batch_id, batch_id
                    )));
                }
            }
            let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
            for mutation in &batch.mutations {
                state.batches_by_key = state
                    .batches_by_key
                    .insert(DocReference::new(mutation.key().clone(), batch_id.as_i32()));
            }
            state.queue.push(batch.clone());
            batch
        };
        for mutation in &batch.mutations {
            self.index_manager
                .add_to_collection_parent_index(txn, &mutation.key().collection_path())?;
        }
        tracing::debug!(batch = %batch.batch_id, mutations = batch.mutations.len(), "queued mutation batch");
        Ok(batch)
    }

    fn lookup_mutation_batch(&self, _txn: &Transaction, batch_id: BatchId) -> StorageResult<Option<MutationBatch>> {
        Ok(self.state.read().lookup(batch_id).cloned())
    }

    fn get_next_mutation_batch_after_batch_id(
        &self,
        _txn: &Transaction,
        batch_id: BatchId,
    ) -> StorageResult<Option<MutationBatch>> {
        let state = self.state.read();
        let index = state.index_of_batch_id(batch_id.next()).max(0);
        Ok(state.batch_at(index).cloned())
    }

    fn get_highest_unacknowledged_batch_id(&self, _txn: &Transaction) -> StorageResult<BatchId> {
        let state = self.state.read();
        if state.queue.is_empty() {
            Ok(BatchId::UNKNOWN)
        } else {
            Ok(BatchId(state.next_batch_id.as_i32() - 1))
        }
    }

    fn get_all_mutation_batches(&self, _txn: &Transaction) -> StorageResult<Vec<MutationBatch>> {
        Ok(self.state.read().queue.clone())
    }

    fn get_all_mutation_batches_affecting_document_key(
        &self,
        _txn: &Transaction,
        key: &DocumentKey,
    ) -> StorageResult<Vec<MutationBatch>> {
        let state = self.state.read();
        let ids: BTreeSet<i32> = state
            .batches_by_key
            .iter_from(&DocReference::first_for_key(key.clone()))
            .take_while(|reference| &reference.key == key)
            .map(|reference| reference.id)
            .collect();
        Ok(state.batches_for_ids(ids))
    }

    fn get_all_mutation_batches_affecting_document_keys(
        &self,
        _txn: &Transaction,
        keys: &DocumentKeySet,
    ) -> StorageResult<Vec<MutationBatch>> {
        let state = self.state.read();
        let mut ids = BTreeSet::new();
        for key in keys.iter() {
            ids.extend(
                state
                    .batches_by_key
                    .iter_from(&DocReference::first_for_key(key.clone()))
                    .take_while(|reference| &reference.key == key)
                    .map(|reference| reference.id),
            );
        }
        Ok(state.batches_for_ids(ids))
    }

    fn get_all_mutation_batches_affecting_query(
        &self,
        _txn: &Transaction,
        query: &Query,
    ) -> StorageResult<Vec<MutationBatch>> {
        if query.is_collection_group_query() {
            return Err(StorageError::invalid_operation(
                "collection group queries must be resolved per collection",
            ));
        }
        let prefix = query.path();
        let state = self.state.read();
        // Keys sort by path, so every key under `prefix` forms one run.
        let ids: BTreeSet<i32> = state
            .batches_by_key
            .iter()
            .skip_while(|reference| reference.key.path() < prefix)
            .take_while(|reference| prefix.is_prefix_of(reference.key.path()))
            .filter(|reference| prefix.is_immediate_parent_of(reference.key.path()))
            .map(|reference| reference.id)
            .collect();
        Ok(state.batches_for_ids(ids))
    }

    fn remove_mutation_batch(&self, txn: &Transaction, batch: &MutationBatch) -> StorageResult<()> {
        {
            let mut state = self.state.write();
            if state.index_of_batch_id(batch.batch_id) != 0 || state.queue.is_empty() {
                return Err(StorageError::invalid_operation(format!(
                    "can only remove the first entry of the mutation queue, got {}",
                    batch.batch_id
                )));
            }
            state.queue.remove(0);
            for mutation in &batch.mutations {
                state.batches_by_key = state
                    .batches_by_key
                    .remove(&DocReference::new(mutation.key().clone(), batch.batch_id.as_i32()));
            }
        }
        if let Some(delegate) = self.delegate.upgrade() {
            for mutation in &batch.mutations {
                delegate.mark_potentially_orphaned(txn, mutation.key())?;
            }
        }
        Ok(())
    }

    fn contains_key(&self, _txn: &Transaction, key: &DocumentKey) -> StorageResult<bool> {
        Ok(self.has_key(key))
    }

    fn get_last_stream_token(&self, _txn: &Transaction) -> StorageResult<Bytes> {
        Ok(self.state.read().last_stream_token.clone())
    }

    fn set_last_stream_token(&self, _txn: &Transaction, token: Bytes) -> StorageResult<()> {
        self.state.write().last_stream_token = token;
        Ok(())
    }

    fn perform_consistency_check(&self, _txn: &Transaction) -> StorageResult<()> {
        let state = self.state.read();
        if state.queue.is_empty() && !state.batches_by_key.is_empty() {
            return Err(StorageError::corrupted(
                "document references remain after the mutation queue drained",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_index_manager::MemoryIndexManager;
    use crate::memory_persistence::MemoryEagerDelegate;
    use docsync_model::{FieldValue, ListenSequenceNumber, ObjectValue, ResourcePath};

    fn txn() -> Transaction {
        Transaction::new("test", ListenSequenceNumber::new(1))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn set(path: &str) -> Mutation {
        Mutation::set(key(path), ObjectValue::from_fields([("a", FieldValue::from(1))]))
    }

    fn queue() -> MemoryMutationQueue {
        let detached: Weak<dyn ReferenceDelegate> = Weak::<MemoryEagerDelegate>::new();
        MemoryMutationQueue::new(Arc::new(MemoryIndexManager::new()), detached)
    }

    fn add(queue: &MemoryMutationQueue, mutations: Vec<Mutation>) -> MutationBatch {
        queue
            .add_mutation_batch(&txn(), Timestamp::new(1, 0), Vec::new(), mutations)
            .unwrap()
    }

    #[test]
    fn batch_ids_increase_from_one() {
        let queue = queue();
        assert!(queue.check_empty(&txn()).unwrap());
        assert_eq!(queue.get_highest_unacknowledged_batch_id(&txn()).unwrap(), BatchId::UNKNOWN);

        let first = add(&queue, vec![set("c/a")]);
        let second = add(&queue, vec![set("c/b")]);
        assert_eq!(first.batch_id, BatchId(1));
        assert_eq!(second.batch_id, BatchId(2));
        assert_eq!(queue.get_highest_unacknowledged_batch_id(&txn()).unwrap(), BatchId(2));
        assert_eq!(
            queue.get_next_mutation_batch_after_batch_id(&txn(), BatchId::UNKNOWN).unwrap(),
            Some(first.clone())
        );
        assert_eq!(
            queue.get_next_mutation_batch_after_batch_id(&txn(), first.batch_id).unwrap(),
            Some(second.clone())
        );
        assert_eq!(queue.get_next_mutation_batch_after_batch_id(&txn(), second.batch_id).unwrap(), None);
    }

    #[test]
    fn only_head_can_be_removed() {
        let queue = queue();
        let first = add(&queue, vec![set("c/a")]);
        let second = add(&queue, vec![set("c/a"), set("c/b")]);

        let err = queue.remove_mutation_batch(&txn(), &second).unwrap_err();
        assert!(matches!(err, StorageError::InvalidOperation(_)));

        queue.remove_mutation_batch(&txn(), &first).unwrap();
        assert_eq!(queue.lookup_mutation_batch(&txn(), first.batch_id).unwrap(), None);
        assert_eq!(queue.lookup_mutation_batch(&txn(), second.batch_id).unwrap(), Some(second.clone()));
        assert_eq!(queue.get_next_mutation_batch_after_batch_id(&txn(), BatchId::UNKNOWN).unwrap(), Some(second.clone()));

        queue.remove_mutation_batch(&txn(), &second).unwrap();
        assert!(queue.check_empty(&txn()).unwrap());
        assert!(!queue.contains_key(&txn(), &key("c/a")).unwrap());
        queue.perform_consistency_check(&txn()).unwrap();
    }

    #[test]
    fn batches_affecting_keys_are_ordered_by_id() {
        let queue = queue();
        let b1 = add(&queue, vec![set("c/a")]);
        let b2 = add(&queue, vec![set("c/b")]);
        let b3 = add(&queue, vec![set("c/a"), set("c/b")]);

        let for_a = queue
            .get_all_mutation_batches_affecting_document_key(&txn(), &key("c/a"))
            .unwrap();
        assert_eq!(for_a, vec![b1.clone(), b3.clone()]);

        let keys = DocumentKeySet::new().insert(key("c/b")).insert(key("c/a"));
        let for_both = queue
            .get_all_mutation_batches_affecting_document_keys(&txn(), &keys)
            .unwrap();
        assert_eq!(for_both, vec![b1, b2, b3]);
    }

    #[test]
    fn query_scan_takes_immediate_children_only() {
        let queue = queue();
        let direct = add(&queue, vec![set("rooms/a")]);
        add(&queue, vec![set("rooms/a/messages/m1")]);
        add(&queue, vec![set("roomsx/b")]);
        add(&queue, vec![set("other/z")]);

        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
        let batches = queue.get_all_mutation_batches_affecting_query(&txn(), &query).unwrap();
        assert_eq!(batches, vec![direct]);

        let group = Query::collection_group("rooms");
        assert!(queue.get_all_mutation_batches_affecting_query(&txn(), &group).is_err());
    }

    #[test]
    fn stream_token_round_trips() {
        let queue = queue();
        assert!(queue.get_last_stream_token(&txn()).unwrap().is_empty());
        queue.set_last_stream_token(&txn(), Bytes::from_static(b"tok")).unwrap();
        assert_eq!(queue.get_last_stream_token(&txn()).unwrap(), Bytes::from_static(b"tok"));
    }
}
