//! Fans query snapshots out to listeners.
//!
//! Several listeners may share one query; the sync engine only sees the
//! first listen and the last unlisten. Each [`QueryListener`] decides on its
//! own whether a snapshot is worth raising, based on its [`ListenOptions`]
//! and the client's online state.

use crate::core::sync_engine::{SyncEngine, SyncEngineEvent};
use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::error::{EngineError, EngineResult};
use crate::remote::OnlineState;
use docsync_model::Query;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Options for a query listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is pending-write or sync state.
    pub include_metadata_changes: bool,
    /// While online, hold the first snapshot back until it is synced with
    /// the backend.
    pub wait_for_sync_when_online: bool,
}

impl ListenOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether metadata-only snapshots are raised.
    #[must_use]
    pub fn with_include_metadata_changes(mut self, include: bool) -> Self {
        self.include_metadata_changes = include;
        self
    }

    /// Sets whether the first snapshot waits for the backend while online.
    #[must_use]
    pub fn with_wait_for_sync_when_online(mut self, wait: bool) -> Self {
        self.wait_for_sync_when_online = wait;
        self
    }
}

/// Receives a listener's snapshots and errors.
pub trait QueryObserver: Send {
    /// A new snapshot.
    fn on_snapshot(&mut self, snapshot: ViewSnapshot);

    /// The listen failed. No further calls follow.
    fn on_error(&mut self, error: EngineError);
}

impl QueryObserver for mpsc::UnboundedSender<EngineResult<ViewSnapshot>> {
    fn on_snapshot(&mut self, snapshot: ViewSnapshot) {
        if self.send(Ok(snapshot)).is_err() {
            debug!("query observer dropped");
        }
    }

    fn on_error(&mut self, error: EngineError) {
        if self.send(Err(error)).is_err() {
            debug!("query observer dropped");
        }
    }
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener:{}", self.0)
    }
}

/// One listener on one query.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: Box<dyn QueryObserver>,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    /// Creates a listener that reports to `observer`.
    pub fn new(query: Query, options: ListenOptions, observer: Box<dyn QueryObserver>) -> Self {
        Self {
            query,
            options,
            observer,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    /// The listened query.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Offers a new snapshot. Returns true if the observer saw an event.
    ///
    /// # Panics
    ///
    /// Panics on a snapshot with neither changes nor a sync state change.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> bool {
        assert!(
            !snapshot.doc_changes.is_empty() || snapshot.sync_state_changed,
            "snapshots must carry changes or a sync state change"
        );
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            let doc_changes = snapshot
                .doc_changes
                .into_iter()
                .filter(|change| change.kind != ChangeType::Metadata)
                .collect();
            ViewSnapshot {
                doc_changes,
                excludes_metadata_changes: true,
                ..snapshot
            }
        };

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            self.observer.on_snapshot(snapshot.clone());
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    /// Reports a failed listen.
    pub fn on_error(&mut self, error: EngineError) {
        self.observer.on_error(error);
    }

    /// Going offline may release a held-back first snapshot. Returns true if
    /// the observer saw an event.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        let Some(snapshot) = self.snapshot.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            self.raise_initial_event(&snapshot);
            return true;
        }
        false
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cached result is only worth raising once the backend is
        // known to be out of reach.
        !snapshot.docs.is_empty() || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        assert!(!self.raised_initial_event, "initial event raised twice for {}", self.query);
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.excludes_metadata_changes,
        );
        self.raised_initial_event = true;
        self.observer.on_snapshot(initial);
    }
}

impl fmt::Debug for QueryListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryListener")
            .field("query", &self.query.canonical_id())
            .field("options", &self.options)
            .field("raised_initial_event", &self.raised_initial_event)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<(ListenerId, QueryListener)>,
}

/// Routes sync engine output to query listeners.
#[derive(Debug)]
pub struct EventManager {
    queries: BTreeMap<String, QueryListenersInfo>,
    listener_queries: HashMap<ListenerId, String>,
    online_state: OnlineState,
    next_listener_id: u64,
    snapshots_in_sync_listeners: Vec<mpsc::UnboundedSender<()>>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    /// Creates an event manager with no listeners.
    pub fn new() -> Self {
        Self {
            queries: BTreeMap::new(),
            listener_queries: HashMap::new(),
            online_state: OnlineState::Unknown,
            next_listener_id: 0,
            snapshots_in_sync_listeners: Vec::new(),
        }
    }

    /// Registers `listener`, starting a sync engine listen for its query if
    /// nobody listens to it yet.
    ///
    /// A failed listen is reported both to the listener and to the caller.
    pub fn listen(&mut self, sync_engine: &mut SyncEngine, mut listener: QueryListener) -> EngineResult<ListenerId> {
        let canonical_id = listener.query().canonical_id();
        if !self.queries.contains_key(&canonical_id) {
            match sync_engine.listen(listener.query().clone()) {
                Ok(snapshot) => {
                    self.queries.insert(
                        canonical_id.clone(),
                        QueryListenersInfo {
                            view_snapshot: Some(snapshot),
                            listeners: Vec::new(),
                        },
                    );
                }
                Err(err) => {
                    warn!(query = %canonical_id, error = %err, "listen failed");
                    listener.on_error(err.clone());
                    return Err(err);
                }
            }
        }

        let listener_id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        listener.apply_online_state_change(self.online_state);

        let mut raised = false;
        if let Some(info) = self.queries.get_mut(&canonical_id) {
            if let Some(snapshot) = info.view_snapshot.clone() {
                raised = listener.on_view_snapshot(snapshot);
            }
            info.listeners.push((listener_id, listener));
        }
        self.listener_queries.insert(listener_id, canonical_id);
        if raised {
            self.raise_snapshots_in_sync_event();
        }
        Ok(listener_id)
    }

    /// Removes a listener, stopping the sync engine listen when it was the
    /// last one for its query. Unknown ids are ignored.
    pub fn unlisten(&mut self, sync_engine: &mut SyncEngine, listener_id: ListenerId) -> EngineResult<()> {
        let Some(canonical_id) = self.listener_queries.remove(&listener_id) else {
            return Ok(());
        };
        let Some(info) = self.queries.get_mut(&canonical_id) else {
            return Ok(());
        };
        let Some(position) = info.listeners.iter().position(|(id, _)| *id == listener_id) else {
            return Ok(());
        };
        let (_, listener) = info.listeners.remove(position);
        if info.listeners.is_empty() {
            self.queries.remove(&canonical_id);
            sync_engine.unlisten(listener.query())?;
        }
        Ok(())
    }

    /// Number of queries with at least one listener.
    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Registers a listener told whenever every listener has seen a
    /// consistent set of snapshots.
    pub fn add_snapshots_in_sync_listener(&mut self, listener: mpsc::UnboundedSender<()>) {
        if listener.send(()).is_ok() {
            self.snapshots_in_sync_listeners.push(listener);
        }
    }

    /// Delivers sync engine events to the listeners.
    pub fn handle_events(&mut self, events: Vec<SyncEngineEvent>) {
        for event in events {
            match event {
                SyncEngineEvent::Snapshots(snapshots) => self.on_watch_change(snapshots),
                SyncEngineEvent::WatchError { query, error } => self.on_watch_error(&query, error),
                SyncEngineEvent::OnlineStateChanged(state) => self.on_online_state_change(state),
            }
        }
    }

    fn on_watch_change(&mut self, snapshots: Vec<ViewSnapshot>) {
        let mut raised = false;
        for snapshot in snapshots {
            let Some(info) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for (_, listener) in &mut info.listeners {
                if listener.on_view_snapshot(snapshot.clone()) {
                    raised = true;
                }
            }
            info.view_snapshot = Some(snapshot);
        }
        if raised {
            self.raise_snapshots_in_sync_event();
        }
    }

    fn on_watch_error(&mut self, query: &Query, error: EngineError) {
        let Some(info) = self.queries.remove(&query.canonical_id()) else {
            return;
        };
        for (listener_id, mut listener) in info.listeners {
            self.listener_queries.remove(&listener_id);
            listener.on_error(error.clone());
        }
    }

    fn on_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        let mut raised = false;
        for info in self.queries.values_mut() {
            for (_, listener) in &mut info.listeners {
                if listener.apply_online_state_change(online_state) {
                    raised = true;
                }
            }
        }
        if raised {
            self.raise_snapshots_in_sync_event();
        }
    }

    fn raise_snapshots_in_sync_event(&mut self) {
        self.snapshots_in_sync_listeners
            .retain(|listener| listener.send(()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::shared_client_state::MemorySharedClientState;
    use crate::core::view_snapshot::DocumentViewChange;
    use crate::remote::{stream_event_channel, EmptyCredentialsProvider, MockConnection};
    use docsync_model::{
        Document, DocumentKey, DocumentKeySet, DocumentSet, DocumentState, FieldValue, ObjectValue, ResourcePath,
        SnapshotVersion, User,
    };
    use docsync_protocol::Code;
    use docsync_storage::MemoryPersistence;
    use std::sync::Arc;

    type Observed = mpsc::UnboundedReceiver<EngineResult<ViewSnapshot>>;

    fn rooms() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap())
    }

    fn doc(path: &str, n: i64, state: DocumentState) -> Document {
        Document::new(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            ObjectValue::from_fields([("n", FieldValue::from(n))]),
            state,
        )
    }

    fn snapshot(docs: &[Document], changes: Vec<DocumentViewChange>, from_cache: bool, sync_changed: bool) -> ViewSnapshot {
        let query = rooms();
        let mut set = DocumentSet::new(query.comparator());
        let mut mutated_keys = DocumentKeySet::new();
        for doc in docs {
            set = set.add(doc.clone());
            if doc.has_local_mutations() {
                mutated_keys = mutated_keys.insert(doc.key().clone());
            }
        }
        ViewSnapshot {
            old_docs: set.empty_like(),
            query,
            docs: set,
            doc_changes: changes,
            mutated_keys,
            from_cache,
            sync_state_changed: sync_changed,
            excludes_metadata_changes: false,
        }
    }

    fn listener(options: ListenOptions) -> (QueryListener, Observed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (QueryListener::new(rooms(), options, Box::new(tx)), rx)
    }

    fn engine() -> SyncEngine {
        let (events, _stream_events) = stream_event_channel();
        let mut engine = SyncEngine::new(
            Arc::new(MemoryPersistence::new()),
            Arc::new(MockConnection::new()),
            Arc::new(EmptyCredentialsProvider),
            Arc::new(MemorySharedClientState::new()),
            &EngineConfig::default(),
            User::UNAUTHENTICATED,
            events,
        );
        engine.start().unwrap();
        engine
    }

    #[test]
    fn synced_first_snapshots_are_raised_immediately() {
        let (mut listener, mut rx) = listener(ListenOptions::new());
        let a = doc("rooms/a", 1, DocumentState::Synced);
        let added = vec![DocumentViewChange::new(ChangeType::Added, a.clone())];
        assert!(listener.on_view_snapshot(snapshot(&[a], added, false, true)));
        let raised = rx.try_recv().unwrap().unwrap();
        assert_eq!(raised.doc_changes.len(), 1);
        assert!(!raised.from_cache);
    }

    #[test]
    fn empty_cached_snapshots_wait_until_offline() {
        let (mut listener, mut rx) = listener(ListenOptions::new());
        assert!(!listener.on_view_snapshot(snapshot(&[], Vec::new(), true, true)));
        assert!(rx.try_recv().is_err());

        assert!(listener.apply_online_state_change(OnlineState::Offline));
        let raised = rx.try_recv().unwrap().unwrap();
        assert!(raised.from_cache);
        assert!(raised.docs.is_empty());
    }

    #[test]
    fn wait_for_sync_holds_back_cached_results_while_online() {
        let options = ListenOptions::new().with_wait_for_sync_when_online(true);
        let (mut listener, mut rx) = listener(options);
        listener.apply_online_state_change(OnlineState::Online);
        let a = doc("rooms/a", 1, DocumentState::Synced);
        let added = vec![DocumentViewChange::new(ChangeType::Added, a.clone())];
        assert!(!listener.on_view_snapshot(snapshot(&[a], added, true, true)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn metadata_only_changes_need_opting_in() {
        let pending = doc("rooms/a", 1, DocumentState::LocalMutations);
        let synced = doc("rooms/a", 1, DocumentState::Synced);
        let first = || {
            let changes = vec![DocumentViewChange::new(ChangeType::Added, pending.clone())];
            snapshot(&[pending.clone()], changes, false, true)
        };
        let metadata = || {
            let changes = vec![DocumentViewChange::new(ChangeType::Metadata, synced.clone())];
            snapshot(&[synced.clone()], changes, false, false)
        };

        let (mut quiet, mut quiet_rx) = listener(ListenOptions::new());
        quiet.on_view_snapshot(first());
        assert!(!quiet.on_view_snapshot(metadata()));
        assert_eq!(quiet_rx.try_recv().unwrap().unwrap().doc_changes.len(), 1);
        assert!(quiet_rx.try_recv().is_err());

        let (mut chatty, mut chatty_rx) = listener(ListenOptions::new().with_include_metadata_changes(true));
        chatty.on_view_snapshot(first());
        assert!(chatty.on_view_snapshot(metadata()));
        chatty_rx.try_recv().unwrap().unwrap();
        let raised = chatty_rx.try_recv().unwrap().unwrap();
        assert!(raised.is_metadata_only());
        assert!(!raised.has_pending_writes());
    }

    #[test]
    fn listeners_share_one_sync_engine_listen() {
        let mut engine = engine();
        let mut manager = EventManager::new();
        let (first, _first_rx) = listener(ListenOptions::new());
        let (second, _second_rx) = listener(ListenOptions::new());
        let first_id = manager.listen(&mut engine, first).unwrap();
        let second_id = manager.listen(&mut engine, second).unwrap();
        assert_ne!(first_id, second_id);
        assert_eq!(manager.query_count(), 1);

        manager.unlisten(&mut engine, first_id).unwrap();
        assert!(engine.target_id_for_query(&rooms()).is_some());
        manager.unlisten(&mut engine, second_id).unwrap();
        assert_eq!(engine.target_id_for_query(&rooms()), None);
        assert_eq!(manager.query_count(), 0);
    }

    #[test]
    fn watch_errors_remove_every_listener() {
        let mut engine = engine();
        let mut manager = EventManager::new();
        let (first, mut first_rx) = listener(ListenOptions::new());
        let (second, mut second_rx) = listener(ListenOptions::new());
        manager.listen(&mut engine, first).unwrap();
        manager.listen(&mut engine, second).unwrap();

        manager.handle_events(vec![SyncEngineEvent::WatchError {
            query: rooms(),
            error: EngineError::rpc(Code::PermissionDenied, "denied"),
        }]);
        assert!(matches!(first_rx.try_recv(), Ok(Err(EngineError::Rpc { .. }))));
        assert!(matches!(second_rx.try_recv(), Ok(Err(EngineError::Rpc { .. }))));
        assert_eq!(manager.query_count(), 0);
    }

    #[test]
    fn snapshots_in_sync_listeners_hear_raised_events() {
        let mut manager = EventManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.add_snapshots_in_sync_listener(tx);
        assert!(rx.try_recv().is_ok());

        let mut engine = engine();
        let (listener, _observed) = listener(ListenOptions::new());
        manager.listen(&mut engine, listener).unwrap();
        manager.handle_events(vec![SyncEngineEvent::OnlineStateChanged(OnlineState::Offline)]);
        assert!(rx.try_recv().is_ok());
    }
}
