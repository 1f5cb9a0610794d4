//! The local view of documents: the remote cache with queued mutations applied.

use docsync_model::{
    DocumentKey, DocumentKeySet, DocumentMap, MaybeDocument, MaybeDocumentMap, NoDocument, Query, SnapshotVersion,
};
use docsync_storage::{
    IndexManager, MutationQueue, NullableMaybeDocumentMap, RemoteDocumentCache, StorageResult, Transaction,
};
use std::sync::Arc;

/// Overlays pending mutation batches onto the remote document cache.
///
/// Missing documents come back as `NoDocument` at `SnapshotVersion::MIN`.
#[derive(Clone)]
pub struct LocalDocumentsView {
    remote_documents: Arc<dyn RemoteDocumentCache>,
    mutation_queue: Arc<dyn MutationQueue>,
    index_manager: Arc<dyn IndexManager>,
}

impl LocalDocumentsView {
    /// Creates a view over the given caches.
    pub fn new(
        remote_documents: Arc<dyn RemoteDocumentCache>,
        mutation_queue: Arc<dyn MutationQueue>,
        index_manager: Arc<dyn IndexManager>,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            index_manager,
        }
    }

    /// The local view of one document, or `None` if nothing is known.
    pub fn get_document(&self, txn: &Transaction, key: &DocumentKey) -> StorageResult<Option<MaybeDocument>> {
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_key(txn, key)?;
        let mut doc = self.remote_documents.get_entry(txn, key)?;
        for batch in &batches {
            doc = batch.apply_to_local_view(key, doc);
        }
        Ok(doc)
    }

    /// The local view of every key in `keys`.
    pub fn get_documents(&self, txn: &Transaction, keys: &DocumentKeySet) -> StorageResult<MaybeDocumentMap> {
        let base_docs = self.remote_documents.get_entries(txn, keys)?;
        self.get_local_view_of_documents(txn, &base_docs)
    }

    /// Applies the queued batches to `base_docs`.
    ///
    /// Absent entries become `NoDocument` at MIN so callers see every key.
    pub fn get_local_view_of_documents(
        &self,
        txn: &Transaction,
        base_docs: &NullableMaybeDocumentMap,
    ) -> StorageResult<MaybeDocumentMap> {
        let keys: DocumentKeySet = base_docs.keys().cloned().collect();
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, &keys)?;

        let mut results = MaybeDocumentMap::new();
        for (key, base) in base_docs.iter() {
            let mut doc = base.clone();
            for batch in &batches {
                doc = batch.apply_to_local_view(key, doc);
            }
            let doc = doc.unwrap_or_else(|| NoDocument::new(key.clone(), SnapshotVersion::MIN, false).into());
            results = results.insert(key.clone(), doc);
        }
        Ok(results)
    }

    /// Documents matching `query` in the local view.
    ///
    /// Only remote entries read after `since_read_time` are scanned; pass MIN
    /// for a full scan.
    pub fn get_documents_matching_query(
        &self,
        txn: &Transaction,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> StorageResult<DocumentMap> {
        if query.is_document_query() {
            self.get_documents_matching_document_query(txn, query)
        } else if query.is_collection_group_query() {
            self.get_documents_matching_collection_group_query(txn, query, since_read_time)
        } else {
            self.get_documents_matching_collection_query(txn, query, since_read_time)
        }
    }

    fn get_documents_matching_document_query(&self, txn: &Transaction, query: &Query) -> StorageResult<DocumentMap> {
        let mut results = DocumentMap::new();
        // a document query always has a valid key path
        let Ok(key) = DocumentKey::from_path(query.path().clone()) else {
            return Ok(results);
        };
        if let Some(MaybeDocument::Document(doc)) = self.get_document(txn, &key)? {
            results = results.insert(key, doc);
        }
        Ok(results)
    }

    fn get_documents_matching_collection_group_query(
        &self,
        txn: &Transaction,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> StorageResult<DocumentMap> {
        let Some(collection_id) = query.collection_group_id() else {
            return self.get_documents_matching_collection_query(txn, query, since_read_time);
        };
        let mut results = DocumentMap::new();
        for parent in self.index_manager.get_collection_parents(txn, collection_id)? {
            let collection_query = query.as_collection_query_at_path(parent.child(collection_id));
            let docs = self.get_documents_matching_collection_query(txn, &collection_query, since_read_time)?;
            for (key, doc) in docs.iter() {
                results = results.insert(key.clone(), doc.clone());
            }
        }
        Ok(results)
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &Transaction,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> StorageResult<DocumentMap> {
        let mut results = self
            .remote_documents
            .get_documents_matching_query(txn, query, since_read_time)?;

        let batches = self.mutation_queue.get_all_mutation_batches_affecting_query(txn, query)?;
        for batch in &batches {
            for key in batch.keys().iter() {
                if !query.path().is_immediate_parent_of(key.path()) {
                    continue;
                }
                let base = results.get(key).cloned().map(MaybeDocument::from);
                match batch.apply_to_local_view(key, base) {
                    Some(MaybeDocument::Document(doc)) => results = results.insert(key.clone(), doc),
                    _ => results = results.remove(key),
                }
            }
        }

        // Local mutations may have pushed documents out of the query.
        let matching: DocumentMap = results
            .iter()
            .filter(|(_, doc)| query.matches(doc))
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect();
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::{
        Document, DocumentState, FieldPath, FieldValue, Mutation, ObjectValue, ResourcePath, Timestamp, User,
    };
    use docsync_storage::{MemoryPersistence, Persistence, PersistenceExt};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, version: i64, n: i32) -> Document {
        Document::new(
            key(path),
            SnapshotVersion::from_micros(version),
            ObjectValue::from_fields([("n", FieldValue::from(n))]),
            DocumentState::Synced,
        )
    }

    fn setup() -> (MemoryPersistence, LocalDocumentsView, Arc<dyn MutationQueue>) {
        let persistence = MemoryPersistence::new();
        persistence.start().unwrap();
        let queue = persistence.mutation_queue(&User::UNAUTHENTICATED);
        let view = LocalDocumentsView::new(
            persistence.remote_document_cache(),
            queue.clone(),
            persistence.index_manager(),
        );
        (persistence, view, queue)
    }

    #[test]
    fn missing_keys_read_as_min_no_documents() {
        let (persistence, view, _) = setup();
        let keys = DocumentKeySet::new().insert(key("rooms/a"));
        let docs = persistence
            .run_transaction("read", |txn| view.get_documents(txn, &keys))
            .unwrap();
        assert!(docs.get(&key("rooms/a")).unwrap().is_no_document_at_min());
    }

    #[test]
    fn queued_writes_overlay_remote_documents() {
        let (persistence, view, queue) = setup();
        let remote = persistence.remote_document_cache();
        persistence
            .run_transaction("write", |txn| {
                remote.add_entry(txn, doc("rooms/a", 1, 1).into(), SnapshotVersion::from_micros(1))?;
                queue.add_mutation_batch(
                    txn,
                    Timestamp::new(1, 0),
                    Vec::new(),
                    vec![Mutation::set(key("rooms/a"), ObjectValue::from_fields([("n", FieldValue::from(2))]))],
                )
            })
            .unwrap();

        let local = persistence
            .run_transaction("read", |txn| view.get_document(txn, &key("rooms/a")))
            .unwrap()
            .unwrap();
        let local = local.as_document().unwrap();
        assert!(local.has_local_mutations());
        assert_eq!(local.field(&FieldPath::new(["n"])), Some(&FieldValue::from(2)));
    }

    #[test]
    fn collection_queries_include_locally_created_documents() {
        let (persistence, view, queue) = setup();
        let remote = persistence.remote_document_cache();
        persistence
            .run_transaction("write", |txn| {
                remote.add_entry(txn, doc("rooms/a", 1, 1).into(), SnapshotVersion::from_micros(1))?;
                remote.add_entry(txn, doc("other/z", 1, 1).into(), SnapshotVersion::from_micros(1))?;
                queue.add_mutation_batch(
                    txn,
                    Timestamp::new(1, 0),
                    Vec::new(),
                    vec![
                        Mutation::set(key("rooms/b"), ObjectValue::from_fields([("n", FieldValue::from(3))])),
                        Mutation::set(key("rooms/b/msgs/m"), ObjectValue::empty()),
                    ],
                )
            })
            .unwrap();

        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
        let docs = persistence
            .run_transaction("query", |txn| {
                view.get_documents_matching_query(txn, &query, SnapshotVersion::MIN)
            })
            .unwrap();
        let keys: Vec<_> = docs.keys().cloned().collect();
        assert_eq!(keys, vec![key("rooms/a"), key("rooms/b")]);
    }

    #[test]
    fn local_deletes_hide_remote_documents() {
        let (persistence, view, queue) = setup();
        let remote = persistence.remote_document_cache();
        persistence
            .run_transaction("write", |txn| {
                remote.add_entry(txn, doc("rooms/a", 1, 1).into(), SnapshotVersion::from_micros(1))?;
                queue.add_mutation_batch(txn, Timestamp::new(1, 0), Vec::new(), vec![Mutation::delete(key("rooms/a"))])
            })
            .unwrap();

        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
        let docs = persistence
            .run_transaction("query", |txn| {
                view.get_documents_matching_query(txn, &query, SnapshotVersion::MIN)
            })
            .unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn document_queries_read_a_single_key() {
        let (persistence, view, _) = setup();
        let remote = persistence.remote_document_cache();
        persistence
            .run_transaction("write", |txn| {
                remote.add_entry(txn, doc("rooms/a", 1, 1).into(), SnapshotVersion::from_micros(1))
            })
            .unwrap();

        let query = Query::at_path(ResourcePath::from_string("rooms/a").unwrap());
        let docs = persistence
            .run_transaction("query", |txn| {
                view.get_documents_matching_query(txn, &query, SnapshotVersion::MIN)
            })
            .unwrap();
        assert_eq!(docs.len(), 1);
    }
}
