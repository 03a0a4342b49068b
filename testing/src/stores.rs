//! In-memory storage for fast, deterministic tests.
//!
//! - [`InMemoryEventConfigStore`]: `HashMap`-backed event configurations
//! - [`InMemoryCapacityStore`]: `HashMap`-backed capacity records with a real version check
//! - [`InMemoryMembershipStore`]: `HashMap`-backed memberships keyed by `(event, user)`
//! - [`ContendedCapacityStore`]: wraps a capacity store and loses the next N writes
//! - [`InMemoryReconcileIndex`]: finds events needing reconciliation across the two
//!   in-memory stores above
//!
//! Every store also exposes direct accessors so tests can inspect state or inject
//! faults that bypass the engine.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use gather_core::error::StoreError;
use gather_core::ledger::CapacityState;
use gather_core::reconcile::needs_reconcile;
use gather_core::store::{
    CapacityStore, EventConfigStore, MembershipStore, ReconcileIndex, StoreFuture,
};
use gather_core::types::{EventId, EventJoinConfig, Membership, MembershipStatus, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

fn ready<'a, T: Send + 'a>(result: Result<T, StoreError>) -> StoreFuture<'a, T> {
    Box::pin(std::future::ready(result))
}

// ============================================================================
// Event configurations
// ============================================================================

/// In-memory event configuration store.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventConfigStore {
    configs: Arc<RwLock<HashMap<EventId, EventJoinConfig>>>,
}

impl InMemoryEventConfigStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored configuration, if any
    #[must_use]
    pub fn get(&self, event_id: EventId) -> Option<EventJoinConfig> {
        self.configs.read().unwrap().get(&event_id).cloned()
    }
}

impl EventConfigStore for InMemoryEventConfigStore {
    fn load_config(&self, event_id: EventId) -> StoreFuture<'_, Option<EventJoinConfig>> {
        ready(Ok(self.get(event_id)))
    }

    fn save_config(&self, config: EventJoinConfig) -> StoreFuture<'_, ()> {
        self.configs
            .write()
            .unwrap()
            .insert(config.event_id, config);
        ready(Ok(()))
    }
}

// ============================================================================
// Capacity
// ============================================================================

/// In-memory capacity store with compare-and-swap writes.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCapacityStore {
    states: Arc<RwLock<HashMap<EventId, CapacityState>>>,
}

impl InMemoryCapacityStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored record, if any
    #[must_use]
    pub fn get(&self, event_id: EventId) -> Option<CapacityState> {
        self.states.read().unwrap().get(&event_id).cloned()
    }

    /// Overwrite a record without a version check, bumping its version.
    ///
    /// Simulates a write made behind the engine's back.
    pub fn force(&self, mut state: CapacityState) {
        let mut states = self.states.write().unwrap();
        let version = states.get(&state.event_id).map_or(0, |s| s.version + 1);
        state.version = version;
        states.insert(state.event_id, state);
    }
}

impl CapacityStore for InMemoryCapacityStore {
    fn create(&self, state: CapacityState) -> StoreFuture<'_, ()> {
        let mut states = self.states.write().unwrap();
        let result = if states.contains_key(&state.event_id) {
            Err(StoreError::AlreadyExists(state.event_id))
        } else {
            states.insert(state.event_id, state);
            Ok(())
        };
        ready(result)
    }

    fn load(&self, event_id: EventId) -> StoreFuture<'_, CapacityState> {
        ready(self.get(event_id).ok_or(StoreError::NotFound(event_id)))
    }

    fn save(&self, mut state: CapacityState, expected_version: u64) -> StoreFuture<'_, u64> {
        let mut states = self.states.write().unwrap();
        let result = match states.get(&state.event_id) {
            None => Err(StoreError::NotFound(state.event_id)),
            Some(current) if current.version != expected_version => Err(StoreError::Conflict {
                event_id: state.event_id,
                expected: expected_version,
                actual: current.version,
            }),
            Some(_) => {
                let version = expected_version + 1;
                state.version = version;
                states.insert(state.event_id, state);
                Ok(version)
            }
        };
        ready(result)
    }

    fn events_with_backlog(&self) -> StoreFuture<'_, Vec<EventId>> {
        let mut events: Vec<EventId> = self
            .states
            .read()
            .unwrap()
            .values()
            .filter(|state| state.has_backlog())
            .map(|state| state.event_id)
            .collect();
        events.sort_unstable();
        ready(Ok(events))
    }
}

/// Capacity store whose next writes lose their race.
///
/// Each injected conflict makes one `save` fail with `Conflict` as if another writer
/// had committed first; the write is not applied. Every other call goes to the inner
/// store.
#[derive(Clone, Debug)]
pub struct ContendedCapacityStore {
    inner: InMemoryCapacityStore,
    conflicts: Arc<AtomicUsize>,
    saves: Arc<AtomicUsize>,
}

impl ContendedCapacityStore {
    /// Wrap `inner`, losing the next `conflicts` writes
    #[must_use]
    pub fn new(inner: InMemoryCapacityStore, conflicts: usize) -> Self {
        Self {
            inner,
            conflicts: Arc::new(AtomicUsize::new(conflicts)),
            saves: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Lose the next `conflicts` writes
    pub fn inject_conflicts(&self, conflicts: usize) {
        self.conflicts.store(conflicts, Ordering::SeqCst);
    }

    /// Injected conflicts not yet consumed
    #[must_use]
    pub fn remaining_conflicts(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }

    /// Number of `save` calls seen, including lost ones
    #[must_use]
    pub fn save_attempts(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// The wrapped store
    #[must_use]
    pub const fn inner(&self) -> &InMemoryCapacityStore {
        &self.inner
    }

    fn take_conflict(&self) -> bool {
        self.conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl CapacityStore for ContendedCapacityStore {
    fn create(&self, state: CapacityState) -> StoreFuture<'_, ()> {
        self.inner.create(state)
    }

    fn load(&self, event_id: EventId) -> StoreFuture<'_, CapacityState> {
        self.inner.load(event_id)
    }

    fn save(&self, state: CapacityState, expected_version: u64) -> StoreFuture<'_, u64> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.take_conflict() {
            return ready(Err(StoreError::Conflict {
                event_id: state.event_id,
                expected: expected_version,
                actual: expected_version + 1,
            }));
        }
        self.inner.save(state, expected_version)
    }

    fn events_with_backlog(&self) -> StoreFuture<'_, Vec<EventId>> {
        self.inner.events_with_backlog()
    }
}

// ============================================================================
// Memberships
// ============================================================================

/// In-memory membership store keyed by `(event, user)`.
#[derive(Clone, Debug, Default)]
pub struct InMemoryMembershipStore {
    records: Arc<RwLock<HashMap<(EventId, UserId), Membership>>>,
}

impl InMemoryMembershipStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored record, if any
    #[must_use]
    pub fn get(&self, event_id: EventId, user_id: UserId) -> Option<Membership> {
        self.records
            .read()
            .unwrap()
            .get(&(event_id, user_id))
            .cloned()
    }

    /// Overwrite a record directly. Simulates a lost or stray write.
    pub fn force(&self, membership: Membership) {
        self.records
            .write()
            .unwrap()
            .insert((membership.event_id, membership.user_id), membership);
    }

    /// Number of records across all events
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether no record exists
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }
}

impl MembershipStore for InMemoryMembershipStore {
    fn load(&self, event_id: EventId, user_id: UserId) -> StoreFuture<'_, Option<Membership>> {
        ready(Ok(self.get(event_id, user_id)))
    }

    fn save(&self, membership: Membership) -> StoreFuture<'_, ()> {
        self.force(membership);
        ready(Ok(()))
    }

    fn list(
        &self,
        event_id: EventId,
        status: Option<MembershipStatus>,
    ) -> StoreFuture<'_, Vec<Membership>> {
        let mut members: Vec<Membership> = self
            .records
            .read()
            .unwrap()
            .values()
            .filter(|m| m.event_id == event_id)
            .filter(|m| status.is_none_or(|s| m.status == s))
            .cloned()
            .collect();
        members.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        ready(Ok(members))
    }
}

// ============================================================================
// Reconcile index
// ============================================================================

/// [`ReconcileIndex`] over an [`InMemoryCapacityStore`] and an
/// [`InMemoryMembershipStore`].
#[derive(Clone, Debug)]
pub struct InMemoryReconcileIndex {
    capacity: InMemoryCapacityStore,
    memberships: InMemoryMembershipStore,
}

impl InMemoryReconcileIndex {
    /// Index reading both stores
    #[must_use]
    pub const fn new(capacity: InMemoryCapacityStore, memberships: InMemoryMembershipStore) -> Self {
        Self {
            capacity,
            memberships,
        }
    }
}

impl ReconcileIndex for InMemoryReconcileIndex {
    fn events_needing_reconcile(
        &self,
        settled_before: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<EventId>> {
        let states = self.capacity.states.read().unwrap();
        let records = self.memberships.records.read().unwrap();
        let mut events: Vec<EventId> = states
            .values()
            .filter(|state| {
                let members: Vec<Membership> = records
                    .values()
                    .filter(|m| m.event_id == state.event_id)
                    .cloned()
                    .collect();
                needs_reconcile(state, &members, settled_before)
            })
            .map(|state| state.event_id)
            .collect();
        events.sort_unstable();
        ready(Ok(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_capacity_save_checks_version() {
        let store = InMemoryCapacityStore::new();
        let event_id = EventId::new();
        store.create(CapacityState::new(event_id, Some(3))).await.unwrap();

        let mut state = store.load(event_id).await.unwrap();
        state.try_admit(UserId::new(), Utc::now());
        assert_eq!(store.save(state.clone(), 0).await.unwrap(), 1);

        let stale = store.save(state, 0).await;
        assert_eq!(
            stale,
            Err(StoreError::Conflict {
                event_id,
                expected: 0,
                actual: 1
            })
        );
        assert_eq!(store.load(event_id).await.unwrap().joined_count(), 1);
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let store = InMemoryCapacityStore::new();
        let event_id = EventId::new();
        store.create(CapacityState::new(event_id, None)).await.unwrap();
        assert_eq!(
            store.create(CapacityState::new(event_id, None)).await,
            Err(StoreError::AlreadyExists(event_id))
        );
    }

    #[tokio::test]
    async fn test_contended_store_loses_injected_writes() {
        let store = ContendedCapacityStore::new(InMemoryCapacityStore::new(), 2);
        let event_id = EventId::new();
        store.create(CapacityState::new(event_id, Some(1))).await.unwrap();
        let state = store.load(event_id).await.unwrap();

        assert!(matches!(
            store.save(state.clone(), 0).await,
            Err(StoreError::Conflict { .. })
        ));
        assert!(store.save(state.clone(), 0).await.is_err());
        assert_eq!(store.save(state, 0).await, Ok(1));
        assert_eq!(store.save_attempts(), 3);
        assert_eq!(store.remaining_conflicts(), 0);
    }

    #[tokio::test]
    async fn test_membership_upsert_keeps_one_record() {
        let store = InMemoryMembershipStore::new();
        let event_id = EventId::new();
        let user = UserId::new();
        let now = Utc::now();

        store
            .save(Membership::new(event_id, user, MembershipStatus::Pending, now))
            .await
            .unwrap();
        store
            .save(Membership::new(event_id, user, MembershipStatus::Joined, now))
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        let joined = store
            .list(event_id, Some(MembershipStatus::Joined))
            .await
            .unwrap();
        assert_eq!(joined.len(), 1);
        assert!(store
            .list(event_id, Some(MembershipStatus::Pending))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_index_flags_seat_without_membership_once_settled() {
        let capacity = InMemoryCapacityStore::new();
        let memberships = InMemoryMembershipStore::new();
        let index = InMemoryReconcileIndex::new(capacity.clone(), memberships.clone());
        let now = Utc::now();

        let (drifted, clean) = (EventId::new(), EventId::new());
        let mut state = CapacityState::new(drifted, Some(1));
        state.try_admit(UserId::new(), now);
        capacity.force(state);
        let mut state = CapacityState::new(clean, Some(1));
        let member = UserId::new();
        state.try_admit(member, now);
        capacity.force(state);
        memberships.force(Membership::new(clean, member, MembershipStatus::Joined, now));

        assert!(index.events_needing_reconcile(now - Duration::seconds(30)).await.unwrap().is_empty());
        assert_eq!(
            index.events_needing_reconcile(now).await.unwrap(),
            vec![drifted]
        );
    }
}
