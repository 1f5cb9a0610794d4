//! Query execution over the local view.

use crate::local::local_documents::LocalDocumentsView;
use docsync_model::{DocumentKeySet, DocumentMap, DocumentSet, LimitType, MaybeDocument, Query, SnapshotVersion};
use docsync_storage::{StorageResult, Transaction};
use tracing::trace;

/// Runs queries against the local documents view.
pub trait QueryEngine: Send + Sync {
    /// Returns every document in the local view that matches `query`.
    ///
    /// `last_limbo_free_snapshot_version` and `remote_keys` describe the last
    /// result the server confirmed; MIN and an empty set force a full scan.
    fn get_documents_matching_query(
        &self,
        txn: &Transaction,
        local_documents: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> StorageResult<DocumentMap>;
}

/// Reuses the last limbo-free result and only scans documents read since.
///
/// A full scan is used when the query matches every document, the target
/// was never limbo-free, or a limit query's boundary may have moved.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexFreeQueryEngine;

impl IndexFreeQueryEngine {
    /// Creates the engine.
    pub fn new() -> Self {
        Self
    }

    fn full_scan(
        txn: &Transaction,
        local_documents: &LocalDocumentsView,
        query: &Query,
    ) -> StorageResult<DocumentMap> {
        local_documents.get_documents_matching_query(txn, query, SnapshotVersion::MIN)
    }

    fn apply_query(query: &Query, docs: impl IntoIterator<Item = MaybeDocument>) -> DocumentSet {
        docs.into_iter()
            .filter_map(MaybeDocument::into_document)
            .filter(|doc| query.matches(doc))
            .fold(DocumentSet::new(query.comparator()), |set, doc| set.add(doc))
    }

    /// True if the previous result can no longer be trusted for a limit query.
    fn needs_refill(
        limit_type: LimitType,
        sorted_previous_results: &DocumentSet,
        remote_keys: &DocumentKeySet,
        limbo_free_snapshot_version: SnapshotVersion,
    ) -> bool {
        // A document was deleted or stopped matching since the last snapshot.
        if remote_keys.len() != sorted_previous_results.len() {
            return true;
        }
        let boundary = match limit_type {
            LimitType::First => sorted_previous_results.last(),
            LimitType::Last => sorted_previous_results.first(),
        };
        boundary.is_some_and(|doc| doc.has_pending_writes() || doc.version() > limbo_free_snapshot_version)
    }
}

impl QueryEngine for IndexFreeQueryEngine {
    fn get_documents_matching_query(
        &self,
        txn: &Transaction,
        local_documents: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> StorageResult<DocumentMap> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return Self::full_scan(txn, local_documents, query);
        }

        let previous = local_documents.get_documents(txn, remote_keys)?;
        let previous_results = Self::apply_query(query, previous.values().cloned());

        if (query.has_limit_to_first() || query.has_limit_to_last())
            && Self::needs_refill(
                query.limit_type(),
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return Self::full_scan(txn, local_documents, query);
        }

        trace!(
            query = %query.canonical_id(),
            since = %last_limbo_free_snapshot_version,
            "reusing previous result"
        );
        let mut results =
            local_documents.get_documents_matching_query(txn, query, last_limbo_free_snapshot_version)?;
        for doc in previous_results.iter() {
            results = results.insert(doc.key().clone(), doc.clone());
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::{
        Direction, Document, DocumentKey, DocumentState, FieldPath, FieldValue, ObjectValue, OrderBy, ResourcePath,
        User,
    };
    use docsync_storage::{MemoryPersistence, Persistence, PersistenceExt, RemoteDocumentCache};
    use std::sync::Arc;

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

    struct Fixture {
        persistence: MemoryPersistence,
        remote: Arc<dyn RemoteDocumentCache>,
        view: LocalDocumentsView,
    }

    impl Fixture {
        fn new() -> Self {
            let persistence = MemoryPersistence::new();
            persistence.start().unwrap();
            let remote = persistence.remote_document_cache();
            let view = LocalDocumentsView::new(
                remote.clone(),
                persistence.mutation_queue(&User::UNAUTHENTICATED),
                persistence.index_manager(),
            );
            Self {
                persistence,
                remote,
                view,
            }
        }

        fn add(&self, doc: Document, read_time: i64) {
            self.persistence
                .run_transaction("add", |txn| {
                    self.remote
                        .add_entry(txn, doc.into(), SnapshotVersion::from_micros(read_time))
                })
                .unwrap();
        }

        fn run(&self, query: &Query, limbo_free: i64, remote_keys: &[&str]) -> Vec<DocumentKey> {
            let keys: DocumentKeySet = remote_keys.iter().map(|p| key(p)).collect();
            let results = self
                .persistence
                .run_transaction("query", |txn| {
                    IndexFreeQueryEngine::new().get_documents_matching_query(
                        txn,
                        &self.view,
                        query,
                        SnapshotVersion::from_micros(limbo_free),
                        &keys,
                    )
                })
                .unwrap();
            results.keys().cloned().collect()
        }
    }

    fn rooms() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap())
    }

    #[test]
    fn previous_results_are_reused_without_rescanning_old_reads() {
        let fixture = Fixture::new();
        fixture.add(doc("rooms/a", 1, 1), 1);
        fixture.add(doc("rooms/b", 1, 2), 1);
        fixture.add(doc("rooms/c", 5, 3), 5);

        let query = rooms().with_order_by(OrderBy::new(FieldPath::new(["n"]), Direction::Ascending));
        // rooms/b was never part of the limbo-free result, and was read before it.
        let keys = fixture.run(&query, 2, &["rooms/a"]);
        assert_eq!(keys, vec![key("rooms/a"), key("rooms/c")]);
    }

    #[test]
    fn never_limbo_free_targets_scan_everything() {
        let fixture = Fixture::new();
        fixture.add(doc("rooms/a", 1, 1), 1);
        fixture.add(doc("rooms/b", 1, 2), 1);

        let query = rooms().with_order_by(OrderBy::new(FieldPath::new(["n"]), Direction::Ascending));
        let keys = fixture.run(&query, 0, &[]);
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn limit_queries_refill_when_a_remote_key_is_gone() {
        let fixture = Fixture::new();
        fixture.add(doc("rooms/a", 1, 1), 1);
        fixture.add(doc("rooms/b", 1, 2), 1);

        let query = rooms()
            .with_order_by(OrderBy::new(FieldPath::new(["n"]), Direction::Ascending))
            .with_limit_to_first(1);
        // rooms/x no longer exists, so the reused result is too small.
        let keys = fixture.run(&query, 2, &["rooms/a", "rooms/x"]);
        assert_eq!(keys, vec![key("rooms/a"), key("rooms/b")]);
    }

    #[test]
    fn limit_queries_refill_when_the_boundary_changed() {
        let fixture = Fixture::new();
        fixture.add(doc("rooms/a", 3, 1), 3);
        fixture.add(doc("rooms/b", 1, 2), 1);

        let query = rooms()
            .with_order_by(OrderBy::new(FieldPath::new(["n"]), Direction::Ascending))
            .with_limit_to_first(1);
        let keys = fixture.run(&query, 2, &["rooms/a"]);
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn needs_refill_checks_the_limit_edge() {
        let query = rooms().with_order_by(OrderBy::new(FieldPath::new(["n"]), Direction::Ascending));
        let set = DocumentSet::new(query.comparator())
            .add(doc("rooms/a", 1, 1))
            .add(doc("rooms/b", 9, 2));
        let keys: DocumentKeySet = [key("rooms/a"), key("rooms/b")].into_iter().collect();
        let limbo_free = SnapshotVersion::from_micros(5);

        assert!(IndexFreeQueryEngine::needs_refill(LimitType::First, &set, &keys, limbo_free));
        assert!(!IndexFreeQueryEngine::needs_refill(LimitType::Last, &set, &keys, limbo_free));
    }
}
