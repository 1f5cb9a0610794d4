//! Query views and the sync coordinator that keeps them current.

mod event_manager;
mod shared_client_state;
mod sync_engine;
mod view;
mod view_snapshot;

pub use event_manager::{EventManager, ListenOptions, ListenerId, QueryListener, QueryObserver};
pub use shared_client_state::{
    ClientId, MemorySharedClientState, MutationBatchState, QueryTargetState, SharedClientState,
};
pub use sync_engine::{SyncCore, SyncEngine, SyncEngineEvent, WriteCallback};
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot};
