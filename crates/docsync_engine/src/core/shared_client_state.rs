//! State shared between clients of the same local persistence.
//!
//! A primary client drives the network and publishes batch and target
//! states here; secondary clients read them to update their own views.

use crate::error::EngineError;
use crate::remote::OnlineState;
use docsync_model::{BatchId, TargetId, User};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Identifies one client instance.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId([u8; 16]);

impl ClientId {
    /// Creates a new random client id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Converts to a UUID.
    #[must_use]
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.to_uuid())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid())
    }
}

/// Sync state of a query target as seen by the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryTargetState {
    /// Results come from cache.
    NotCurrent,
    /// Results are consistent with the backend.
    Current,
    /// The backend rejected the listen.
    Rejected,
}

/// Lifecycle of a mutation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationBatchState {
    /// Written locally, not yet acknowledged.
    Pending,
    /// Committed by the backend.
    Acknowledged,
    /// Rejected by the backend.
    Rejected,
}

/// Receives state updates from the sync engine and exposes them to other
/// clients.
pub trait SharedClientState: Send + Sync {
    /// This client's id.
    fn client_id(&self) -> ClientId;

    /// Records a new local batch.
    fn add_pending_mutation(&self, batch_id: BatchId);

    /// Records that a batch was acknowledged or rejected.
    fn update_mutation_state(&self, batch_id: BatchId, state: MutationBatchState, error: Option<&EngineError>);

    /// Registers a target this client listens to and returns its known state.
    fn add_local_query_target(&self, target_id: TargetId) -> QueryTargetState;

    /// Unregisters a target this client listens to.
    fn remove_local_query_target(&self, target_id: TargetId);

    /// True if any client still listens to `target_id`.
    fn is_active_query_target(&self, target_id: TargetId) -> bool;

    /// Records the sync state of a target.
    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState, error: Option<&EngineError>);

    /// Forgets the state of a released target.
    fn clear_query_state(&self, target_id: TargetId);

    /// Records a user change and the batches it hid and revealed.
    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]);

    /// Publishes the primary's online state.
    fn set_online_state(&self, online_state: OnlineState);
}

#[derive(Debug, Default)]
struct SharedState {
    user: User,
    online_state: Option<OnlineState>,
    active_targets: BTreeSet<TargetId>,
    query_states: BTreeMap<TargetId, QueryTargetState>,
    mutation_states: BTreeMap<BatchId, MutationBatchState>,
}

/// Shared state for a single process with one client.
#[derive(Debug, Default)]
pub struct MemorySharedClientState {
    client_id: ClientId,
    state: Mutex<SharedState>,
}

impl MemorySharedClientState {
    /// Creates the state with a fresh client id.
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded state of a batch.
    pub fn mutation_state(&self, batch_id: BatchId) -> Option<MutationBatchState> {
        self.state.lock().mutation_states.get(&batch_id).copied()
    }

    /// The recorded state of a target.
    pub fn query_state(&self, target_id: TargetId) -> Option<QueryTargetState> {
        self.state.lock().query_states.get(&target_id).copied()
    }

    /// The last published online state.
    pub fn online_state(&self) -> Option<OnlineState> {
        self.state.lock().online_state
    }

    /// Targets some client listens to.
    pub fn active_targets(&self) -> Vec<TargetId> {
        self.state.lock().active_targets.iter().copied().collect()
    }
}

impl SharedClientState for MemorySharedClientState {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn add_pending_mutation(&self, batch_id: BatchId) {
        self.state
            .lock()
            .mutation_states
            .insert(batch_id, MutationBatchState::Pending);
    }

    fn update_mutation_state(&self, batch_id: BatchId, state: MutationBatchState, _error: Option<&EngineError>) {
        self.state.lock().mutation_states.insert(batch_id, state);
    }

    fn add_local_query_target(&self, target_id: TargetId) -> QueryTargetState {
        let mut shared = self.state.lock();
        shared.active_targets.insert(target_id);
        *shared
            .query_states
            .entry(target_id)
            .or_insert(QueryTargetState::NotCurrent)
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        self.state.lock().active_targets.remove(&target_id);
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.state.lock().active_targets.contains(&target_id)
    }

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState, _error: Option<&EngineError>) {
        let mut shared = self.state.lock();
        if shared.active_targets.contains(&target_id) {
            shared.query_states.insert(target_id, state);
        }
    }

    fn clear_query_state(&self, target_id: TargetId) {
        self.state.lock().query_states.remove(&target_id);
    }

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]) {
        let mut shared = self.state.lock();
        shared.user = user.clone();
        for batch_id in removed_batch_ids {
            shared.mutation_states.remove(batch_id);
        }
        for batch_id in added_batch_ids {
            shared.mutation_states.insert(*batch_id, MutationBatchState::Pending);
        }
    }

    fn set_online_state(&self, online_state: OnlineState) {
        self.state.lock().online_state = Some(online_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_unique() {
        assert_ne!(ClientId::new(), ClientId::new());
    }

    #[test]
    fn query_targets_track_activity_and_state() {
        let shared = MemorySharedClientState::new();
        assert_eq!(shared.add_local_query_target(TargetId(2)), QueryTargetState::NotCurrent);
        shared.update_query_state(TargetId(2), QueryTargetState::Current, None);
        assert_eq!(shared.add_local_query_target(TargetId(2)), QueryTargetState::Current);

        shared.remove_local_query_target(TargetId(2));
        assert!(!shared.is_active_query_target(TargetId(2)));
        shared.update_query_state(TargetId(2), QueryTargetState::Rejected, None);
        assert_eq!(shared.query_state(TargetId(2)), Some(QueryTargetState::Current));

        shared.clear_query_state(TargetId(2));
        assert_eq!(shared.query_state(TargetId(2)), None);
    }

    #[test]
    fn user_changes_replace_pending_batches() {
        let shared = MemorySharedClientState::new();
        shared.add_pending_mutation(BatchId(1));
        shared.handle_user_change(&User::new("alice"), &[BatchId(1)], &[BatchId(7)]);
        assert_eq!(shared.mutation_state(BatchId(1)), None);
        assert_eq!(shared.mutation_state(BatchId(7)), Some(MutationBatchState::Pending));
    }
}
