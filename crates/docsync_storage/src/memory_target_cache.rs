//! In-memory target cache.

use crate::error::{StorageError, StorageResult};
use crate::persistence::{ReferenceDelegate, Transaction};
use crate::reference_set::ReferenceSet;
use crate::target_cache::TargetCache;
use docsync_model::{
    DocumentKey, DocumentKeySet, ListenSequenceNumber, SnapshotVersion, Target, TargetData, TargetId,
    TargetIdGenerator,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Weak;

#[derive(Debug)]
struct Metadata {
    /// Keyed by canonical id.
    targets: HashMap<String, TargetData>,
    last_remote_snapshot_version: SnapshotVersion,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    id_generator: TargetIdGenerator,
}

/// Target metadata and matching keys held in memory.
pub struct MemoryTargetCache {
    metadata: RwLock<Metadata>,
    references: RwLock<ReferenceSet>,
    delegate: Weak<dyn ReferenceDelegate>,
}

impl MemoryTargetCache {
    /// Creates an empty cache reporting key changes to `delegate`.
    pub fn new(delegate: Weak<dyn ReferenceDelegate>) -> Self {
        Self {
            metadata: RwLock::new(Metadata {
                targets: HashMap::new(),
                last_remote_snapshot_version: SnapshotVersion::MIN,
                highest_target_id: TargetId(0),
                highest_sequence_number: ListenSequenceNumber::new(0),
                id_generator: TargetIdGenerator::for_target_cache(),
            }),
            references: RwLock::new(ReferenceSet::new()),
            delegate,
        }
    }

    /// True if any target matches `key`; needs no transaction.
    pub(crate) fn has_key(&self, key: &DocumentKey) -> bool {
        self.references.read().contains_key(key)
    }

    /// Visits every cached target.
    pub fn for_each_target(&self, mut f: impl FnMut(&TargetData)) {
        for target_data in self.metadata.read().targets.values() {
            f(target_data);
        }
    }

    fn save(&self, target_data: &TargetData) {
        let mut metadata = self.metadata.write();
        metadata
            .targets
            .insert(target_data.target.canonical_id(), target_data.clone());
        if target_data.target_id > metadata.highest_target_id {
            metadata.highest_target_id = target_data.target_id;
            metadata.id_generator = TargetIdGenerator::starting_after(target_data.target_id);
        }
        if target_data.sequence_number > metadata.highest_sequence_number {
            metadata.highest_sequence_number = target_data.sequence_number;
        }
    }
}

impl std::fmt::Debug for MemoryTargetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTargetCache")
            .field("metadata", &*self.metadata.read())
            .finish_non_exhaustive()
    }
}

impl TargetCache for MemoryTargetCache {
    fn allocate_target_id(&self, _txn: &Transaction) -> StorageResult<TargetId> {
        let mut metadata = self.metadata.write();
        let target_id = metadata.id_generator.next_id();
        metadata.highest_target_id = target_id;
        Ok(target_id)
    }

    fn get_last_remote_snapshot_version(&self, _txn: &Transaction) -> StorageResult<SnapshotVersion> {
        Ok(self.metadata.read().last_remote_snapshot_version)
    }

    fn get_highest_sequence_number(&self, _txn: &Transaction) -> StorageResult<ListenSequenceNumber> {
        Ok(self.metadata.read().highest_sequence_number)
    }

    fn set_target_and_sequence_metadata(
        &self,
        _txn: &Transaction,
        highest_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: SnapshotVersion,
    ) -> StorageResult<()> {
        let mut metadata = self.metadata.write();
        if last_remote_snapshot_version < metadata.last_remote_snapshot_version {
            return Err(StorageError::invalid_operation(format!(
                "remote snapshot version moved backwards: {} -> {}",
                metadata.last_remote_snapshot_version, last_remote_snapshot_version
            )));
        }
        metadata.last_remote_snapshot_version = last_remote_snapshot_version;
        if highest_sequence_number > metadata.highest_sequence_number {
            metadata.highest_sequence_number = highest_sequence_number;
        }
        Ok(())
    }

    fn add_target_data(&self, _txn: &Transaction, target_data: &TargetData) -> StorageResult<()> {
        if self
            .metadata
            .read()
            .targets
            .contains_key(&target_data.target.canonical_id())
        {
            return Err(StorageError::invalid_operation(format!(
                "adding a target that already exists: {}",
                target_data.target
            )));
        }
        self.save(target_data);
        Ok(())
    }

    fn update_target_data(&self, _txn: &Transaction, target_data: &TargetData) -> StorageResult<()> {
        if !self
            .metadata
            .read()
            .targets
            .contains_key(&target_data.target.canonical_id())
        {
            return Err(StorageError::not_found(format!(
                "updating a target that does not exist: {}",
                target_data.target
            )));
        }
        self.save(target_data);
        Ok(())
    }

    fn remove_target_data(&self, _txn: &Transaction, target_data: &TargetData) -> StorageResult<()> {
        let removed = self
            .metadata
            .write()
            .targets
            .remove(&target_data.target.canonical_id());
        if removed.is_none() {
            return Err(StorageError::not_found(format!(
                "removing a target that does not exist: {}",
                target_data.target
            )));
        }
        self.references
            .write()
            .remove_references_for_id(target_data.target_id.as_i32());
        Ok(())
    }

    fn get_target_count(&self, _txn: &Transaction) -> StorageResult<usize> {
        Ok(self.metadata.read().targets.len())
    }

    fn get_target_data(&self, _txn: &Transaction, target: &Target) -> StorageResult<Option<TargetData>> {
        // Canonical ids can collide, so confirm the descriptor too.
        Ok(self
            .metadata
            .read()
            .targets
            .get(&target.canonical_id())
            .filter(|target_data| &target_data.target == target)
            .cloned())
    }

    fn add_matching_keys(&self, txn: &Transaction, keys: &DocumentKeySet, target_id: TargetId) -> StorageResult<()> {
        self.references.write().add_references(keys, target_id.as_i32());
        if let Some(delegate) = self.delegate.upgrade() {
            for key in keys.iter() {
                delegate.add_reference(txn, key)?;
            }
        }
        Ok(())
    }

    fn remove_matching_keys(
        &self,
        txn: &Transaction,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> StorageResult<()> {
        self.references.write().remove_references(keys, target_id.as_i32());
        if let Some(delegate) = self.delegate.upgrade() {
            for key in keys.iter() {
                delegate.remove_reference(txn, key)?;
            }
        }
        Ok(())
    }

    fn remove_matching_keys_for_target_id(&self, _txn: &Transaction, target_id: TargetId) -> StorageResult<()> {
        self.references.write().remove_references_for_id(target_id.as_i32());
        Ok(())
    }

    fn get_matching_keys_for_target_id(&self, _txn: &Transaction, target_id: TargetId) -> StorageResult<DocumentKeySet> {
        Ok(self.references.read().references_for_id(target_id.as_i32()))
    }

    fn contains_key(&self, _txn: &Transaction, key: &DocumentKey) -> StorageResult<bool> {
        Ok(self.has_key(key))
    }
}
