//! Capacity & Waitlist Ledger.
//!
//! The only component allowed to mutate an event's joined count and waitlist. This is
//! CRITICAL for the "last slot" problem: two simultaneous admissions for one remaining
//! slot must yield exactly one `Admitted`.
//!
//! **Concurrency Strategy**: optimistic concurrency control. Every operation loads the
//! [`CapacityState`], applies a pure mutation, and writes it back with a
//! compare-and-swap on `version`. A lost race (`CapacityRace`) re-runs the whole
//! load-mutate-save cycle, so occupancy is re-checked at commit time. Races are retried
//! a bounded number of times; an admission that still loses is reported as `Full`.
//!
//! Every seat and queue entry carries the instant it was written. Reconciliation uses it
//! to tell an admission still in flight from one whose membership write was lost.
//!
//! ```text
//! load(v) ──▶ mutate ──▶ save(expected = v) ──ok──▶ done
//!                              │
//!                          conflict ──▶ backoff ──▶ load(v') ...
//! ```

use crate::error::{LedgerError, StoreError};
use crate::metrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use crate::store::CapacityStore;
use crate::types::{CapacitySnapshot, EventId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// ============================================================================
// Data Structures
// ============================================================================

/// A queued user. Ordered FIFO by `enqueued_at`, ties broken by `user_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WaitlistEntry {
    /// When the user was queued
    pub enqueued_at: DateTime<Utc>,
    /// Queued user
    pub user_id: UserId,
}

/// Authoritative occupancy of one event.
///
/// Invariant: `joined_count() <= max` whenever `max` is set, no user is both an
/// occupant and queued, and nobody is admitted past a queued user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityState {
    /// Event this record belongs to
    pub event_id: EventId,
    /// Maximum participants (`None` = uncapped)
    pub max: Option<u32>,
    /// Users counted against capacity, with the instant each took their slot
    pub occupants: BTreeMap<UserId, DateTime<Utc>>,
    /// Queue of users waiting for a slot, kept sorted
    pub waitlist: Vec<WaitlistEntry>,
    /// Optimistic concurrency version
    pub version: u64,
}

/// Result of an admission attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The user holds a slot
    Admitted,
    /// The user was queued at the given 1-based position
    Waitlisted {
        /// Position in the waitlist
        position: usize,
    },
    /// No slot and no waitlist path; nothing changed
    Full,
}

/// Result of a waitlist enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueue {
    /// Newly queued at the given 1-based position
    Enqueued {
        /// Position in the waitlist
        position: usize,
    },
    /// Already queued; nothing changed
    AlreadyQueued {
        /// Position in the waitlist
        position: usize,
    },
    /// The user already holds a slot; nothing changed
    AlreadyAdmitted,
}

/// Result of a release, optionally combined with a promotion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ReleaseOutcome {
    /// Whether the user was counted and their slot was returned
    pub was_counted: bool,
    /// Whether a slot is free after the release
    pub freed_slot: bool,
    /// User promoted into the freed slot
    pub promoted: Option<UserId>,
}

impl CapacityState {
    /// Empty capacity record at version 0
    #[must_use]
    pub const fn new(event_id: EventId, max: Option<u32>) -> Self {
        Self {
            event_id,
            max,
            occupants: BTreeMap::new(),
            waitlist: Vec::new(),
            version: 0,
        }
    }

    /// Number of counted participants
    #[must_use]
    pub fn joined_count(&self) -> u32 {
        u32::try_from(self.occupants.len()).unwrap_or(u32::MAX)
    }

    /// Number of queued users
    #[must_use]
    pub fn waitlist_length(&self) -> u32 {
        u32::try_from(self.waitlist.len()).unwrap_or(u32::MAX)
    }

    /// Whether another participant fits
    #[must_use]
    pub fn has_free_slot(&self) -> bool {
        self.max.is_none_or(|max| self.joined_count() < max)
    }

    /// Whether the event is at capacity
    #[must_use]
    pub fn is_full(&self) -> bool {
        !self.has_free_slot()
    }

    /// Whether the user holds a slot
    #[must_use]
    pub fn is_occupant(&self, user_id: UserId) -> bool {
        self.occupants.contains_key(&user_id)
    }

    /// When the user took their slot
    #[must_use]
    pub fn admitted_at(&self, user_id: UserId) -> Option<DateTime<Utc>> {
        self.occupants.get(&user_id).copied()
    }

    /// Whether nobody is queued ahead of the user
    #[must_use]
    pub fn is_next_in_line(&self, user_id: UserId) -> bool {
        self.waitlist
            .first()
            .is_none_or(|head| head.user_id == user_id)
    }

    /// 1-based waitlist position of the user
    #[must_use]
    pub fn waitlist_position(&self, user_id: UserId) -> Option<usize> {
        self.waitlist
            .iter()
            .position(|entry| entry.user_id == user_id)
            .map(|index| index + 1)
    }

    /// Read-only view for callers
    #[must_use]
    pub fn snapshot(&self) -> CapacitySnapshot {
        CapacitySnapshot {
            joined_count: self.joined_count(),
            max: self.max,
            waitlist_length: self.waitlist_length(),
        }
    }

    /// Whether a promotion is owed: a free slot with someone waiting
    #[must_use]
    pub fn has_backlog(&self) -> bool {
        self.has_free_slot() && !self.waitlist.is_empty()
    }

    /// Take a slot if one is free and nobody is queued ahead. Returns whether state
    /// changed alongside the outcome.
    ///
    /// Admitting an existing occupant is a no-op `Admitted`. While a backlog exists only
    /// the waitlist head may be admitted, and it leaves the waitlist.
    pub fn try_admit(&mut self, user_id: UserId, now: DateTime<Utc>) -> (Admission, bool) {
        if self.is_occupant(user_id) {
            return (Admission::Admitted, false);
        }
        if !self.has_free_slot() || !self.is_next_in_line(user_id) {
            return (Admission::Full, false);
        }
        self.seat(user_id, now);
        (Admission::Admitted, true)
    }

    /// Give a slot back to a user who held one, ahead of the queue; queue them if the
    /// event filled up in the meantime.
    pub fn readmit(&mut self, user_id: UserId, now: DateTime<Utc>) -> (Admission, bool) {
        if self.is_occupant(user_id) {
            return (Admission::Admitted, false);
        }
        if self.has_free_slot() {
            self.seat(user_id, now);
            return (Admission::Admitted, true);
        }
        self.queue(user_id, now)
    }

    fn seat(&mut self, user_id: UserId, now: DateTime<Utc>) {
        self.waitlist.retain(|entry| entry.user_id != user_id);
        self.occupants.insert(user_id, now);
    }

    fn queue(&mut self, user_id: UserId, now: DateTime<Utc>) -> (Admission, bool) {
        match self.enqueue(user_id, now) {
            (Enqueue::Enqueued { position }, changed)
            | (Enqueue::AlreadyQueued { position }, changed) => {
                (Admission::Waitlisted { position }, changed)
            }
            (Enqueue::AlreadyAdmitted, _) => (Admission::Admitted, false),
        }
    }

    /// Queue a user unless already queued or admitted.
    pub fn enqueue(&mut self, user_id: UserId, enqueued_at: DateTime<Utc>) -> (Enqueue, bool) {
        if self.is_occupant(user_id) {
            return (Enqueue::AlreadyAdmitted, false);
        }
        if let Some(position) = self.waitlist_position(user_id) {
            return (Enqueue::AlreadyQueued { position }, false);
        }

        let entry = WaitlistEntry {
            enqueued_at,
            user_id,
        };
        let index = self.waitlist.partition_point(|existing| *existing < entry);
        self.waitlist.insert(index, entry);
        (Enqueue::Enqueued { position: index + 1 }, true)
    }

    /// Admit if a slot is free and nobody is waiting, otherwise queue.
    pub fn admit_or_enqueue(&mut self, user_id: UserId, now: DateTime<Utc>) -> (Admission, bool) {
        match self.try_admit(user_id, now) {
            (Admission::Full, _) => self.queue(user_id, now),
            admitted => admitted,
        }
    }

    /// Drop a user from the waitlist. Returns whether they were queued.
    pub fn remove_from_waitlist(&mut self, user_id: UserId) -> bool {
        let before = self.waitlist.len();
        self.waitlist.retain(|entry| entry.user_id != user_id);
        self.waitlist.len() != before
    }

    /// Return the user's slot if they held one.
    pub fn release(&mut self, user_id: UserId) -> ReleaseOutcome {
        let was_counted = self.occupants.remove(&user_id).is_some();
        ReleaseOutcome {
            was_counted,
            freed_slot: was_counted && self.has_free_slot(),
            promoted: None,
        }
    }

    /// Move the head of the waitlist into a free slot.
    pub fn promote_next(&mut self, now: DateTime<Utc>) -> Option<UserId> {
        if !self.has_free_slot() || self.waitlist.is_empty() {
            return None;
        }
        let head = self.waitlist.remove(0);
        self.occupants.insert(head.user_id, now);
        Some(head.user_id)
    }

    /// Release then promote, as one mutation.
    pub fn release_and_promote(&mut self, user_id: UserId, now: DateTime<Utc>) -> ReleaseOutcome {
        let mut outcome = self.release(user_id);
        if outcome.freed_slot {
            outcome.promoted = self.promote_next(now);
        }
        outcome
    }

    /// Release the user only if they took their slot at or before `settled_before`.
    ///
    /// A more recent seat may belong to an admission whose membership write is still in
    /// flight and is left alone.
    pub fn release_settled(&mut self, user_id: UserId, settled_before: DateTime<Utc>) -> bool {
        if self
            .admitted_at(user_id)
            .is_some_and(|admitted_at| admitted_at <= settled_before)
        {
            self.occupants.remove(&user_id);
            true
        } else {
            false
        }
    }

    /// Drop the user's queue entry only if it was written at or before `settled_before`.
    pub fn dequeue_settled(&mut self, user_id: UserId, settled_before: DateTime<Utc>) -> bool {
        let before = self.waitlist.len();
        self.waitlist
            .retain(|entry| entry.user_id != user_id || entry.enqueued_at > settled_before);
        self.waitlist.len() != before
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Atomic admit/release/promote operations over a [`CapacityStore`].
///
/// Each operation is a single optimistic transaction scoped to one event.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn CapacityStore>,
    policy: RetryPolicy,
}

impl Ledger {
    /// Creates a new `Ledger`
    #[must_use]
    pub fn new(store: Arc<dyn CapacityStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Retry policy applied to lost races
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Create the capacity record of a new event.
    ///
    /// # Errors
    ///
    /// Returns `Store(AlreadyExists)` if the event already has one.
    pub async fn create(&self, event_id: EventId, max: Option<u32>) -> Result<CapacityState, LedgerError> {
        let state = CapacityState::new(event_id, max);
        self.store.create(state.clone()).await?;
        Ok(state)
    }

    /// Current capacity record.
    ///
    /// # Errors
    ///
    /// Returns a store error if loading fails.
    pub async fn state(&self, event_id: EventId) -> Result<CapacityState, LedgerError> {
        Ok(self.store.load(event_id).await?)
    }

    /// Current capacity view.
    ///
    /// # Errors
    ///
    /// Returns a store error if loading fails.
    pub async fn snapshot(&self, event_id: EventId) -> Result<CapacitySnapshot, LedgerError> {
        Ok(self.state(event_id).await?.snapshot())
    }

    /// Events owing a promotion.
    ///
    /// # Errors
    ///
    /// Returns a store error if the query fails.
    pub async fn events_with_backlog(&self) -> Result<Vec<EventId>, LedgerError> {
        Ok(self.store.events_with_backlog().await?)
    }

    /// Take a slot iff one is free.
    ///
    /// Exhausted races are reported as [`Admission::Full`]: the caller sees a full event,
    /// never the race.
    ///
    /// # Errors
    ///
    /// Returns a store error for backend failures.
    pub async fn try_admit(
        &self,
        event_id: EventId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Admission, LedgerError> {
        let result = self
            .transact(event_id, |state| state.try_admit(user_id, now))
            .await;
        let admission = Self::race_as_full(event_id, result)?;
        metrics::record_admission(admission);
        Ok(admission)
    }

    /// Take a slot if one is free, otherwise queue, in one transaction.
    ///
    /// Like [`try_admit`](Self::try_admit), exhausted races are reported as
    /// [`Admission::Full`].
    ///
    /// # Errors
    ///
    /// Returns a store error for backend failures.
    pub async fn admit_or_enqueue(
        &self,
        event_id: EventId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Admission, LedgerError> {
        let result = self
            .transact(event_id, |state| state.admit_or_enqueue(user_id, now))
            .await;
        let admission = Self::race_as_full(event_id, result)?;
        metrics::record_admission(admission);
        Ok(admission)
    }

    /// Give a slot back to a joined member the ledger lost track of, queueing them if
    /// the event is full.
    ///
    /// # Errors
    ///
    /// Returns a store error for backend failures, or `CapacityRace` if contention
    /// never resolves.
    pub async fn readmit(
        &self,
        event_id: EventId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Admission, LedgerError> {
        self.transact(event_id, |state| state.readmit(user_id, now))
            .await
    }

    /// Queue a user; idempotent if already queued.
    ///
    /// # Errors
    ///
    /// Returns a store error for backend failures, or `CapacityRace` if contention
    /// never resolves.
    pub async fn enqueue_waitlist(
        &self,
        event_id: EventId,
        user_id: UserId,
        enqueued_at: DateTime<Utc>,
    ) -> Result<Enqueue, LedgerError> {
        self.transact(event_id, |state| state.enqueue(user_id, enqueued_at))
            .await
    }

    /// Drop a user from the waitlist without touching the count.
    ///
    /// # Errors
    ///
    /// Returns a store error for backend failures, or `CapacityRace` if contention
    /// never resolves.
    pub async fn remove_from_waitlist(&self, event_id: EventId, user_id: UserId) -> Result<bool, LedgerError> {
        self.transact(event_id, |state| {
            let removed = state.remove_from_waitlist(user_id);
            (removed, removed)
        })
        .await
    }

    /// Return the user's slot. Returns whether a slot is now free.
    ///
    /// # Errors
    ///
    /// Returns a store error for backend failures, or `CapacityRace` if contention
    /// never resolves.
    pub async fn release(&self, event_id: EventId, user_id: UserId) -> Result<bool, LedgerError> {
        let outcome = self
            .transact(event_id, |state| {
                let outcome = state.release(user_id);
                (outcome, outcome.was_counted)
            })
            .await?;
        Ok(outcome.freed_slot)
    }

    /// Move the head of the waitlist into a free slot, if both exist.
    ///
    /// Re-checks occupancy at commit time, so repeated calls never double-promote.
    ///
    /// # Errors
    ///
    /// Returns a store error for backend failures, or `CapacityRace` if contention
    /// never resolves.
    pub async fn promote_next(
        &self,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> Result<Option<UserId>, LedgerError> {
        self.transact(event_id, |state| {
            let promoted = state.promote_next(now);
            (promoted, promoted.is_some())
        })
        .await
    }

    /// Release the user's slot and promote into it within the same transaction.
    ///
    /// # Errors
    ///
    /// Returns a store error for backend failures, or `CapacityRace` if contention
    /// never resolves.
    pub async fn release_and_promote(
        &self,
        event_id: EventId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, LedgerError> {
        self.transact(event_id, |state| {
            let outcome = state.release_and_promote(user_id, now);
            (outcome, outcome.was_counted)
        })
        .await
    }

    /// Return a slot taken at or before `settled_before`. Returns whether it was
    /// released.
    ///
    /// # Errors
    ///
    /// Returns a store error for backend failures, or `CapacityRace` if contention
    /// never resolves.
    pub async fn release_settled(
        &self,
        event_id: EventId,
        user_id: UserId,
        settled_before: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        self.transact(event_id, |state| {
            let released = state.release_settled(user_id, settled_before);
            (released, released)
        })
        .await
    }

    /// Drop a queue entry written at or before `settled_before`. Returns whether it was
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns a store error for backend failures, or `CapacityRace` if contention
    /// never resolves.
    pub async fn dequeue_settled(
        &self,
        event_id: EventId,
        user_id: UserId,
        settled_before: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        self.transact(event_id, |state| {
            let dropped = state.dequeue_settled(user_id, settled_before);
            (dropped, dropped)
        })
        .await
    }

    /// Run `mutate` as an optimistic transaction, retrying lost races.
    ///
    /// `mutate` returns the outcome and whether it changed the state; unchanged states
    /// are not written.
    async fn transact<T, F>(&self, event_id: EventId, mutate: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: Fn(&mut CapacityState) -> (T, bool) + Sync,
    {
        let store = &self.store;
        let mutate = &mutate;

        retry_with_predicate(
            &self.policy,
            || async move {
                let mut state = store.load(event_id).await?;
                let expected = state.version;
                let (outcome, changed) = mutate(&mut state);
                if !changed {
                    return Ok(outcome);
                }

                match store.save(state, expected).await {
                    Ok(_version) => Ok(outcome),
                    Err(StoreError::Conflict { actual, .. }) => {
                        tracing::warn!(
                            %event_id,
                            expected,
                            actual,
                            "Capacity write lost a race"
                        );
                        metrics::record_capacity_conflict();
                        Err(LedgerError::CapacityRace(event_id))
                    }
                    Err(error) => Err(error.into()),
                }
            },
            |error| matches!(error, LedgerError::CapacityRace(_)),
        )
        .await
    }

    fn race_as_full(
        event_id: EventId,
        result: Result<Admission, LedgerError>,
    ) -> Result<Admission, LedgerError> {
        match result {
            Ok(admission) => Ok(admission),
            Err(LedgerError::CapacityRace(_)) => {
                tracing::warn!(%event_id, "Admission contention exhausted retries, reporting full");
                Ok(Admission::Full)
            }
            Err(error) => Err(error),
        }
    }
}
