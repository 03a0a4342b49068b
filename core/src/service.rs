//! Join service: the write and read surface of the engine.
//!
//! Each write loads the event configuration, the actor's role and the target's
//! membership, runs the [`MembershipReducer`], executes the returned [`LedgerEffect`]s
//! against the [`Ledger`], feeds ledger outcomes back to the reducer and persists the
//! result. Writes for one event are serialized by an in-process lock; the ledger's
//! version check keeps capacity correct across processes sharing a store.
//!
//! # Write ordering
//!
//! - Admissions commit to the ledger first, then the membership is saved.
//! - Releases and dequeues save the membership first, then touch the ledger.
//!
//! A failure between the two writes leaves a discrepancy that
//! [`JoinService::reconcile`] repairs. Another instance's writes may be between the
//! two steps at any moment, so reconciliation only undoes seats and queue entries older
//! than the grace period.

use crate::environment::Clock;
use crate::error::JoinError;
use crate::facade::{JoinState, evaluate};
use crate::ledger::{Admission, Ledger, WaitlistEntry};
use crate::membership::{
    LedgerEffect, MembershipAction, MembershipReducer, MembershipState, OnFull, TransitionEnv,
};
use crate::metrics;
use crate::reconcile::{Drift, ReconcileReport};
use crate::reducer::{Effects, Reducer};
use crate::retry::RetryPolicy;
use crate::store::{CapacityStore, EventConfigStore, MembershipStore, ReconcileIndex};
use crate::types::{
    CapacitySnapshot, EventId, EventJoinConfig, ManualClosure, Membership, MembershipStatus, Role,
    UserId,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Actor recorded on transitions the engine performs on its own (promotions, repairs).
pub const SYSTEM_ACTOR: UserId = UserId::from_uuid(Uuid::nil());

/// Default age below which reconciliation treats a seat or queue entry as in flight.
pub const DEFAULT_RECONCILE_GRACE: Duration = Duration::seconds(30);

/// Injected dependencies of the [`JoinService`].
#[derive(Clone)]
pub struct JoinEnvironment {
    /// Source of the current instant
    pub clock: Arc<dyn Clock>,
    /// Event configurations
    pub events: Arc<dyn EventConfigStore>,
    /// Capacity records
    pub capacity: Arc<dyn CapacityStore>,
    /// Membership records
    pub memberships: Arc<dyn MembershipStore>,
    /// Cross-record query for the background reconciler
    pub index: Arc<dyn ReconcileIndex>,
}

/// One async mutex per event, created on first use and dropped once nobody holds or
/// awaits it.
#[derive(Default)]
struct EventLocks {
    inner: Mutex<HashMap<EventId, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held lock of one event; removes the map entry on drop when it was the last user.
struct EventGuard<'a> {
    locks: &'a EventLocks,
    event_id: EventId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl EventLocks {
    async fn acquire(&self, event_id: EventId) -> EventGuard<'_> {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(event_id).or_default())
        };
        EventGuard {
            locks: self,
            event_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Drop the entry of `event_id` if only the map still references it.
    fn prune(&self, event_id: EventId) {
        let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&event_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&event_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for EventGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.prune(self.event_id);
    }
}

/// Event join lifecycle service.
pub struct JoinService {
    env: JoinEnvironment,
    ledger: Ledger,
    reducer: MembershipReducer,
    locks: EventLocks,
    reconcile_grace: Duration,
}

impl JoinService {
    /// Creates a new `JoinService` with the given ledger retry policy.
    #[must_use]
    pub fn new(env: JoinEnvironment, policy: RetryPolicy) -> Self {
        let ledger = Ledger::new(Arc::clone(&env.capacity), policy);
        Self {
            env,
            ledger,
            reducer: MembershipReducer::new(),
            locks: EventLocks::default(),
            reconcile_grace: DEFAULT_RECONCILE_GRACE,
        }
    }

    /// Age below which reconciliation leaves seats and queue entries alone.
    ///
    /// Must exceed the longest expected gap between a ledger write and the membership
    /// write that follows it on any instance sharing the stores.
    #[must_use]
    pub fn with_reconcile_grace(mut self, grace: Duration) -> Self {
        self.reconcile_grace = grace.max(Duration::zero());
        self
    }

    /// The capacity ledger
    #[must_use]
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Register a new event: validate and persist its configuration, create its empty
    /// capacity record and make `owner` a joined owner.
    ///
    /// The owner is not counted against capacity.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig`: the configuration violates an invariant
    /// - `Storage`: a store failed, or the event already exists
    #[tracing::instrument(skip(self, config), fields(event_id = %config.event_id))]
    pub async fn register_event(
        &self,
        config: EventJoinConfig,
        owner: UserId,
    ) -> Result<(), JoinError> {
        config.validate()?;
        let event_id = config.event_id;
        let max = config.max;
        let _guard = self.locks.acquire(event_id).await;

        self.env.events.save_config(config).await?;
        self.ledger.create(event_id, max).await?;
        self.env
            .memberships
            .save(Membership::owner(event_id, owner, self.env.clock.now()))
            .await?;

        tracing::info!(%event_id, %owner, ?max, "Event registered");
        Ok(())
    }

    /// Close joining with a reason shown to users (owner/moderator).
    ///
    /// # Errors
    ///
    /// - `NotAuthorized`: the actor cannot moderate
    /// - `EventNotFound` / `Storage`
    #[tracing::instrument(skip(self, reason))]
    pub async fn close_join_manually(
        &self,
        event_id: EventId,
        actor: UserId,
        reason: impl Into<String> + Send,
    ) -> Result<(), JoinError> {
        let reason = reason.into();
        let _guard = self.locks.acquire(event_id).await;
        let mut config = self.require_moderator(event_id, actor).await?;

        config.manual_closure = Some(ManualClosure {
            reason: reason.clone(),
            closed_at: self.env.clock.now(),
            closed_by: actor,
        });
        self.env.events.save_config(config).await?;

        metrics::record_transition("close_join", "ok");
        tracing::info!(%event_id, %actor, %reason, "Joining closed manually");
        Ok(())
    }

    /// Lift a manual closure (owner/moderator). Idempotent.
    ///
    /// # Errors
    ///
    /// - `NotAuthorized`: the actor cannot moderate
    /// - `EventNotFound` / `Storage`
    #[tracing::instrument(skip(self))]
    pub async fn reopen_join(&self, event_id: EventId, actor: UserId) -> Result<(), JoinError> {
        let _guard = self.locks.acquire(event_id).await;
        let mut config = self.require_moderator(event_id, actor).await?;

        if config.manual_closure.take().is_some() {
            self.env.events.save_config(config).await?;
            tracing::info!(%event_id, %actor, "Joining reopened");
        }
        metrics::record_transition("reopen_join", "ok");
        Ok(())
    }

    // ========================================================================
    // Membership transitions
    // ========================================================================

    /// Ask to join: admitted or waitlisted in `OPEN` mode, pending in `REQUEST` mode.
    ///
    /// # Errors
    ///
    /// Window, closure, mode and status violations as typed [`JoinError`]s.
    #[tracing::instrument(skip(self))]
    pub async fn request_join(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<MembershipStatus, JoinError> {
        self.transition(event_id, user_id, user_id, MembershipAction::Request)
            .await
    }

    /// Withdraw a pending request or waitlist spot.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless pending, waitlisted, absent or already left.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_join_request(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<MembershipStatus, JoinError> {
        self.transition(event_id, user_id, user_id, MembershipAction::CancelRequest)
            .await
    }

    /// Leave the event, promoting the head of the waitlist into the freed slot.
    ///
    /// # Errors
    ///
    /// `OwnerCannotLeave` for the owner, `InvalidTransition` unless joined.
    #[tracing::instrument(skip(self))]
    pub async fn leave_event(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<MembershipStatus, JoinError> {
        self.transition(event_id, user_id, user_id, MembershipAction::Leave)
            .await
    }

    /// Join an `OPEN` event, queueing if it is full.
    ///
    /// # Errors
    ///
    /// Window, closure, mode and status violations as typed [`JoinError`]s.
    #[tracing::instrument(skip(self))]
    pub async fn join_waitlist(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<MembershipStatus, JoinError> {
        self.transition(event_id, user_id, user_id, MembershipAction::JoinWaitlist)
            .await
    }

    /// Leave the waitlist. No capacity effect.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless waitlisted.
    #[tracing::instrument(skip(self))]
    pub async fn leave_waitlist(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<MembershipStatus, JoinError> {
        self.transition(event_id, user_id, user_id, MembershipAction::LeaveWaitlist)
            .await
    }

    /// Invite a user (owner/moderator).
    ///
    /// # Errors
    ///
    /// `NotAuthorized`, `AlreadyPresent` or `InvalidTransition`.
    #[tracing::instrument(skip(self))]
    pub async fn invite_member(
        &self,
        event_id: EventId,
        actor: UserId,
        user_id: UserId,
    ) -> Result<MembershipStatus, JoinError> {
        self.transition(event_id, actor, user_id, MembershipAction::Invite)
            .await
    }

    /// Accept an invitation; waitlisted when the event is full.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless invited.
    #[tracing::instrument(skip(self))]
    pub async fn accept_invite(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<MembershipStatus, JoinError> {
        self.transition(event_id, user_id, user_id, MembershipAction::AcceptInvite)
            .await
    }

    /// Approve a pending request (owner/moderator).
    ///
    /// # Errors
    ///
    /// `EventFull` when no slot is free; `NotAuthorized` or `InvalidTransition`.
    #[tracing::instrument(skip(self))]
    pub async fn approve_membership(
        &self,
        event_id: EventId,
        actor: UserId,
        user_id: UserId,
    ) -> Result<MembershipStatus, JoinError> {
        self.transition(event_id, actor, user_id, MembershipAction::Approve)
            .await
    }

    /// Reject a pending request (owner/moderator).
    ///
    /// # Errors
    ///
    /// `NotAuthorized` or `InvalidTransition`.
    #[tracing::instrument(skip(self, reason))]
    pub async fn reject_membership(
        &self,
        event_id: EventId,
        actor: UserId,
        user_id: UserId,
        reason: impl Into<String> + Send,
    ) -> Result<MembershipStatus, JoinError> {
        let action = MembershipAction::Reject {
            reason: reason.into(),
        };
        self.transition(event_id, actor, user_id, action).await
    }

    /// Remove a joined member (owner/moderator), promoting into the freed slot.
    ///
    /// # Errors
    ///
    /// `OwnerCannotLeave` for the owner, `NotAuthorized` or `InvalidTransition`.
    #[tracing::instrument(skip(self, reason))]
    pub async fn kick_member(
        &self,
        event_id: EventId,
        actor: UserId,
        user_id: UserId,
        reason: impl Into<String> + Send,
    ) -> Result<MembershipStatus, JoinError> {
        let action = MembershipAction::Kick {
            reason: reason.into(),
        };
        self.transition(event_id, actor, user_id, action).await
    }

    /// Ban a joined member (owner/moderator), promoting into the freed slot.
    ///
    /// # Errors
    ///
    /// `OwnerCannotLeave` for the owner, `NotAuthorized` or `InvalidTransition`.
    #[tracing::instrument(skip(self, reason))]
    pub async fn ban_member(
        &self,
        event_id: EventId,
        actor: UserId,
        user_id: UserId,
        reason: impl Into<String> + Send,
    ) -> Result<MembershipStatus, JoinError> {
        let action = MembershipAction::Ban {
            reason: reason.into(),
        };
        self.transition(event_id, actor, user_id, action).await
    }

    /// Lift a ban (owner/moderator); the user may request again.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` or `InvalidTransition`.
    #[tracing::instrument(skip(self))]
    pub async fn unban_member(
        &self,
        event_id: EventId,
        actor: UserId,
        user_id: UserId,
    ) -> Result<MembershipStatus, JoinError> {
        self.transition(event_id, actor, user_id, MembershipAction::Unban)
            .await
    }

    /// Make a joined member a moderator or a participant (owner only).
    ///
    /// # Errors
    ///
    /// `NotAuthorized`, `OwnerCannotLeave` or `InvalidTransition`.
    #[tracing::instrument(skip(self))]
    pub async fn assign_role(
        &self,
        event_id: EventId,
        actor: UserId,
        user_id: UserId,
        role: Role,
    ) -> Result<MembershipStatus, JoinError> {
        self.transition(event_id, actor, user_id, MembershipAction::AssignRole { role })
            .await
    }

    /// Manually trigger a reconciliation pass (owner/moderator).
    ///
    /// # Errors
    ///
    /// - `NotAuthorized`: the actor cannot moderate
    /// - `EventNotFound` / `Storage`
    #[tracing::instrument(skip(self))]
    pub async fn promote_from_waitlist(
        &self,
        event_id: EventId,
        actor: UserId,
    ) -> Result<ReconcileReport, JoinError> {
        if !self
            .actor_role(event_id, actor)
            .await?
            .is_some_and(Role::can_moderate)
        {
            return Err(JoinError::NotAuthorized(actor));
        }
        self.reconcile(event_id).await
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Repair discrepancies between the ledger and membership records, then promote
    /// while a slot is free and someone is waiting. Idempotent.
    ///
    /// Each repair re-reads the membership first and the ledger re-checks the age of a
    /// seat or queue entry at commit time, so writes still in flight on another instance
    /// are never undone.
    ///
    /// # Errors
    ///
    /// `EventNotFound` or `Storage`.
    #[allow(clippy::too_many_lines)] // One loop per kind of drift
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self, event_id: EventId) -> Result<ReconcileReport, JoinError> {
        let _guard = self.locks.acquire(event_id).await;
        let config = self.load_config(event_id).await?;
        let now = self.env.clock.now();
        let settled_before = self.settled_before(now);
        let env = TransitionEnv::new(now, config, SYSTEM_ACTOR, None);

        let capacity = self.ledger.state(event_id).await?;
        let memberships = self.env.memberships.list(event_id, None).await?;
        let drift = Drift::detect(&capacity, &memberships, settled_before);
        let mut report = ReconcileReport::default();

        for user_id in drift.dequeue {
            if self.load_state(event_id, user_id).await?.status() != MembershipStatus::Waitlist
                && self
                    .ledger
                    .dequeue_settled(event_id, user_id, settled_before)
                    .await?
            {
                report.dequeued += 1;
            }
        }

        for user_id in drift.release {
            let status = self.load_state(event_id, user_id).await?.status();
            if !matches!(status, MembershipStatus::Joined | MembershipStatus::Waitlist)
                && self
                    .ledger
                    .release_settled(event_id, user_id, settled_before)
                    .await?
            {
                tracing::warn!(%event_id, %user_id, %status, "Released seat without a joined membership");
                report.released += 1;
            }
        }

        for user_id in drift.repair {
            let mut state = self.load_state(event_id, user_id).await?;
            if state.status() == MembershipStatus::Waitlist {
                self.reducer
                    .reduce(&mut state, MembershipAction::Promoted, &env)?;
                self.persist(&state).await?;
                report.repaired += 1;
            }
        }

        for user_id in drift.readmit {
            let mut state = self.load_state(event_id, user_id).await?;
            if state.status() != MembershipStatus::Joined || state.role() == Role::Owner {
                continue;
            }
            match self.ledger.readmit(event_id, user_id, now).await? {
                Admission::Admitted => report.readmitted += 1,
                Admission::Waitlisted { position } => {
                    self.reducer
                        .reduce(&mut state, MembershipAction::Waitlisted, &env)?;
                    self.persist(&state).await?;
                    tracing::warn!(%event_id, %user_id, position, "Joined member had no slot left, moved to waitlist");
                    report.requeued += 1;
                }
                Admission::Full => {}
            }
        }

        for user_id in drift.requeue {
            let mut state = self.load_state(event_id, user_id).await?;
            let Some(queued_at) = state
                .record
                .as_ref()
                .filter(|record| record.status == MembershipStatus::Waitlist)
                .map(|record| record.updated_at)
            else {
                continue;
            };
            match self
                .ledger
                .admit_or_enqueue(event_id, user_id, queued_at)
                .await?
            {
                Admission::Admitted => {
                    self.reducer
                        .reduce(&mut state, MembershipAction::Promoted, &env)?;
                    self.persist(&state).await?;
                    metrics::record_promotion("reconcile");
                    report.promoted += 1;
                }
                Admission::Waitlisted { .. } => report.requeued += 1,
                Admission::Full => {}
            }
        }

        while let Some(user_id) = self.ledger.promote_next(event_id, now).await? {
            report.promoted += self.promote_chain(user_id, &env, "reconcile").await?;
        }

        metrics::record_reconcile_run();
        if report.is_empty() {
            tracing::debug!(%event_id, "Reconciliation found nothing to do");
        } else {
            tracing::info!(%event_id, ?report, "Reconciliation repaired event");
        }
        Ok(report)
    }

    /// Events owing a promotion.
    ///
    /// # Errors
    ///
    /// `Storage` when the query fails.
    pub async fn events_with_backlog(&self) -> Result<Vec<EventId>, JoinError> {
        Ok(self.ledger.events_with_backlog().await?)
    }

    /// Events owing a promotion or whose ledger and memberships disagree, ignoring
    /// writes younger than the grace period.
    ///
    /// # Errors
    ///
    /// `Storage` when the query fails.
    pub async fn events_needing_reconcile(&self) -> Result<Vec<EventId>, JoinError> {
        let settled_before = self.settled_before(self.env.clock.now());
        Ok(self
            .env
            .index
            .events_needing_reconcile(settled_before)
            .await?)
    }

    fn settled_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.reconcile_grace)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// The join state of an event as seen by one user.
    ///
    /// # Errors
    ///
    /// `EventNotFound` or `Storage`.
    pub async fn get_event_join_state(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<JoinState, JoinError> {
        let config = self.load_config(event_id).await?;
        let capacity = self.ledger.state(event_id).await?;
        let membership = self.env.memberships.load(event_id, user_id).await?;
        Ok(evaluate(
            self.env.clock.now(),
            &config,
            &capacity,
            membership.as_ref(),
        ))
    }

    /// Joined count, maximum and waitlist length of an event.
    ///
    /// # Errors
    ///
    /// `EventNotFound` or `Storage`.
    pub async fn get_event_capacity(&self, event_id: EventId) -> Result<CapacitySnapshot, JoinError> {
        Ok(self.ledger.snapshot(event_id).await?)
    }

    /// Memberships of an event, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// `Storage` when the query fails.
    pub async fn list_members(
        &self,
        event_id: EventId,
        status: Option<MembershipStatus>,
    ) -> Result<Vec<Membership>, JoinError> {
        Ok(self.env.memberships.list(event_id, status).await?)
    }

    /// The waitlist of an event, head first.
    ///
    /// # Errors
    ///
    /// `EventNotFound` or `Storage`.
    pub async fn get_waitlist(&self, event_id: EventId) -> Result<Vec<WaitlistEntry>, JoinError> {
        Ok(self.ledger.state(event_id).await?.waitlist)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Run one transition under the event lock and record its outcome.
    async fn transition(
        &self,
        event_id: EventId,
        actor: UserId,
        user_id: UserId,
        action: MembershipAction,
    ) -> Result<MembershipStatus, JoinError> {
        let name = action.name();
        let _guard = self.locks.acquire(event_id).await;

        let result = self.apply(event_id, actor, user_id, action).await;
        match &result {
            Ok(status) => {
                metrics::record_transition(name, "ok");
                tracing::info!(%event_id, %user_id, %actor, action = name, %status, "Membership transition applied");
            }
            Err(JoinError::Storage(message)) => {
                metrics::record_transition(name, "error");
                tracing::error!(%event_id, %user_id, action = name, %message, "Membership transition failed");
            }
            Err(error) => {
                metrics::record_transition(name, "rejected");
                tracing::warn!(%event_id, %user_id, action = name, kind = error.kind(), %error, "Membership transition rejected");
            }
        }
        result
    }

    async fn apply(
        &self,
        event_id: EventId,
        actor: UserId,
        user_id: UserId,
        action: MembershipAction,
    ) -> Result<MembershipStatus, JoinError> {
        let config = self.load_config(event_id).await?;
        let actor_role = self.actor_role(event_id, actor).await?;
        let env = TransitionEnv::new(self.env.clock.now(), config, actor, actor_role);

        let mut state = self.load_state(event_id, user_id).await?;
        let effects = self.reducer.reduce(&mut state, action, &env)?;
        self.execute(&mut state, effects, &env).await?;
        Ok(state.status())
    }

    /// Execute ledger effects, feeding outcomes back to the reducer, and persist.
    async fn execute(
        &self,
        state: &mut MembershipState,
        effects: Effects<LedgerEffect>,
        env: &TransitionEnv,
    ) -> Result<(), JoinError> {
        let event_id = state.event_id;
        if !effects.iter().any(LedgerEffect::runs_before_persist) {
            self.persist(state).await?;
        }

        for effect in effects {
            match effect {
                LedgerEffect::Admit { user_id, on_full } => {
                    let admission = match on_full {
                        OnFull::Waitlist => {
                            self.ledger
                                .admit_or_enqueue(event_id, user_id, env.now)
                                .await?
                        }
                        OnFull::Refuse => {
                            self.ledger.try_admit(event_id, user_id, env.now).await?
                        }
                    };
                    let outcome = match admission {
                        Admission::Admitted => MembershipAction::Admitted,
                        Admission::Waitlisted { position } => {
                            tracing::info!(%event_id, %user_id, position, "User waitlisted");
                            MembershipAction::Waitlisted
                        }
                        Admission::Full => MembershipAction::AdmissionRefused,
                    };
                    self.reducer.reduce(state, outcome, env)?;
                    self.persist(state).await?;
                }
                LedgerEffect::Release { user_id } => {
                    let outcome = self
                        .ledger
                        .release_and_promote(event_id, user_id, env.now)
                        .await?;
                    if let Some(promoted) = outcome.promoted {
                        self.promote_chain(promoted, env, "release").await?;
                    }
                }
                LedgerEffect::Dequeue { user_id } => {
                    self.ledger.remove_from_waitlist(event_id, user_id).await?;
                }
            }
        }
        Ok(())
    }

    /// Mark `first` as joined after the ledger promoted them. A promoted user whose
    /// membership no longer reads waitlisted gives the slot back and the next in line is
    /// tried. Returns the number of users promoted.
    async fn promote_chain(
        &self,
        first: UserId,
        env: &TransitionEnv,
        trigger: &'static str,
    ) -> Result<usize, JoinError> {
        let event_id = env.config.event_id;
        let mut promoted = 0;
        let mut visited = HashSet::new();
        let mut next = Some(first);

        while let Some(user_id) = next.take() {
            if !visited.insert(user_id) {
                break;
            }
            let mut state = self.load_state(event_id, user_id).await?;
            match self
                .reducer
                .reduce(&mut state, MembershipAction::Promoted, env)
            {
                Ok(_) => {
                    self.persist(&state).await?;
                    metrics::record_promotion(trigger);
                    tracing::info!(%event_id, %user_id, trigger, "Promoted from waitlist");
                    promoted += 1;
                }
                Err(error) => {
                    tracing::warn!(%event_id, %user_id, %error, "Skipping stale waitlist entry");
                    next = self
                        .ledger
                        .release_and_promote(event_id, user_id, env.now)
                        .await?
                        .promoted;
                }
            }
        }
        Ok(promoted)
    }

    async fn load_config(&self, event_id: EventId) -> Result<EventJoinConfig, JoinError> {
        self.env
            .events
            .load_config(event_id)
            .await?
            .ok_or(JoinError::EventNotFound(event_id))
    }

    async fn load_state(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<MembershipState, JoinError> {
        Ok(self
            .env
            .memberships
            .load(event_id, user_id)
            .await?
            .map_or_else(
                || MembershipState::absent(event_id, user_id),
                MembershipState::from_record,
            ))
    }

    async fn persist(&self, state: &MembershipState) -> Result<(), JoinError> {
        if let Some(record) = &state.record {
            self.env.memberships.save(record.clone()).await?;
        }
        Ok(())
    }

    /// Role of the actor, counted only while they are a joined member.
    async fn actor_role(&self, event_id: EventId, actor: UserId) -> Result<Option<Role>, JoinError> {
        Ok(self
            .env
            .memberships
            .load(event_id, actor)
            .await?
            .filter(|m| m.status == MembershipStatus::Joined)
            .map(|m| m.role))
    }

    async fn require_moderator(
        &self,
        event_id: EventId,
        actor: UserId,
    ) -> Result<EventJoinConfig, JoinError> {
        let config = self.load_config(event_id).await?;
        if self
            .actor_role(event_id, actor)
            .await?
            .is_some_and(Role::can_moderate)
        {
            Ok(config)
        } else {
            Err(JoinError::NotAuthorized(actor))
        }
    }
}
