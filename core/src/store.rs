//! Storage traits the engine runs against.
//!
//! The persisted shape is storage-agnostic: one configuration record per event, one
//! capacity record per event (count, occupants and waitlist, guarded by a version), and
//! one membership record per `(event, user)` pair.
//!
//! # Implementations
//!
//! - `gather-postgres`: `PostgreSQL` tables with an optimistic version column
//! - `gather-testing`: `HashMap`-backed stores for fast, deterministic tests
//!
//! # Dyn Compatibility
//!
//! Methods return explicit `Pin<Box<dyn Future>>` so the service can hold the stores as
//! `Arc<dyn Trait>`.

use crate::error::StoreError;
use crate::ledger::CapacityState;
use crate::types::{EventId, EventJoinConfig, Membership, MembershipStatus, UserId};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by every store method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Persistence for the join-related fields of the event record.
pub trait EventConfigStore: Send + Sync {
    /// Load the configuration of an event, `None` if the event is unknown.
    ///
    /// # Errors
    ///
    /// - `Backend`: database connection or query failed
    fn load_config(&self, event_id: EventId) -> StoreFuture<'_, Option<EventJoinConfig>>;

    /// Insert or replace the configuration of an event.
    ///
    /// # Errors
    ///
    /// - `Backend`: database connection or query failed
    fn save_config(&self, config: EventJoinConfig) -> StoreFuture<'_, ()>;
}

/// Persistence for [`CapacityState`], written only by the [`Ledger`](crate::ledger::Ledger).
pub trait CapacityStore: Send + Sync {
    /// Create the capacity record of a new event at its initial version.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists`: the event already has a capacity record
    /// - `Backend`: database connection or query failed
    fn create(&self, state: CapacityState) -> StoreFuture<'_, ()>;

    /// Load the current capacity record, including its version.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no record for this event
    /// - `Backend`: database connection or query failed
    fn load(&self, event_id: EventId) -> StoreFuture<'_, CapacityState>;

    /// Compare-and-swap: persist `state` iff the stored version equals
    /// `expected_version`. The stored version becomes `expected_version + 1`, which is
    /// returned.
    ///
    /// # Errors
    ///
    /// - `Conflict`: the stored version moved on since it was loaded
    /// - `NotFound`: no record for this event
    /// - `Backend`: database connection or query failed
    fn save(&self, state: CapacityState, expected_version: u64) -> StoreFuture<'_, u64>;

    /// Events that have a free slot and a non-empty waitlist.
    ///
    /// Inline transitions never leave an event in this shape.
    ///
    /// # Errors
    ///
    /// - `Backend`: database connection or query failed
    fn events_with_backlog(&self) -> StoreFuture<'_, Vec<EventId>>;
}

/// Persistence for [`Membership`] records.
pub trait MembershipStore: Send + Sync {
    /// Load one membership, `None` if the user never interacted with the event.
    ///
    /// # Errors
    ///
    /// - `Backend`: database connection or query failed
    fn load(&self, event_id: EventId, user_id: UserId) -> StoreFuture<'_, Option<Membership>>;

    /// Upsert on `(event_id, user_id)`; never creates a second record for the pair.
    ///
    /// # Errors
    ///
    /// - `Backend`: database connection or query failed
    fn save(&self, membership: Membership) -> StoreFuture<'_, ()>;

    /// List the memberships of an event, optionally filtered by status, ordered by
    /// `updated_at` then user.
    ///
    /// # Errors
    ///
    /// - `Backend`: database connection or query failed
    fn list(
        &self,
        event_id: EventId,
        status: Option<MembershipStatus>,
    ) -> StoreFuture<'_, Vec<Membership>>;
}

/// Query across capacity and membership records, used by the background reconciler.
///
/// A backend able to see both record kinds answers it in one pass. The definition of
/// an event needing work is [`needs_reconcile`](crate::reconcile::needs_reconcile).
pub trait ReconcileIndex: Send + Sync {
    /// Events whose capacity record owes a promotion or disagrees with their
    /// memberships. Seats and queue entries written after `settled_before` count as in
    /// flight and never flag an event on their own.
    ///
    /// # Errors
    ///
    /// - `Backend`: database connection or query failed
    fn events_needing_reconcile(
        &self,
        settled_before: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<EventId>>;
}
