//! Local persistence coordination: the local store, the local documents view
//! and the query engine.

mod local_documents;
mod local_store;
mod local_view_changes;
mod query_engine;

pub use local_documents::LocalDocumentsView;
pub use local_store::{LocalStore, LocalWriteResult, QueryResult, UserChangeResult};
pub use local_view_changes::LocalViewChanges;
pub use query_engine::{IndexFreeQueryEngine, QueryEngine};
