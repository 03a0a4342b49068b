//! Reconciliation of ledger and membership records after interrupted writes.
//!
//! Each test simulates a crash between the ledger write and the membership write by
//! forcing one side of the pair, then checks that reconciliation restores a
//! consistent state. Seats and queue entries are only undone once older than the
//! grace period, so those tests move the clock past it first.
//!
//! Run with: `cargo test -p gather-core --test reconcile_test`

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

use chrono::{DateTime, Duration, TimeZone, Utc};
use gather_core::service::DEFAULT_RECONCILE_GRACE;
use gather_core::store::{MembershipStore, StoreFuture};
use gather_core::{
    EventId, JoinError, Ledger, Membership, MembershipStatus, ReconcileReport, Reconciler,
    UserId,
};
use gather_testing::{
    EventConfigBuilder, InMemoryMembershipStore, TestContext, init_test_tracing,
    test_retry_policy,
};
use std::sync::Arc;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 7, 1, 8, 0, 0).unwrap()
}

fn past_grace(ctx: &TestContext) {
    ctx.clock.advance(DEFAULT_RECONCILE_GRACE + Duration::minutes(1));
}

/// Membership store whose writes land only after `delay`, like a slow database round
/// trip on another instance.
struct SlowMembershipStore {
    inner: InMemoryMembershipStore,
    delay: std::time::Duration,
}

impl MembershipStore for SlowMembershipStore {
    fn load(&self, event_id: EventId, user_id: UserId) -> StoreFuture<'_, Option<Membership>> {
        self.inner.load(event_id, user_id)
    }

    fn save(&self, membership: Membership) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.save(membership).await
        })
    }

    fn list(
        &self,
        event_id: EventId,
        status: Option<MembershipStatus>,
    ) -> StoreFuture<'_, Vec<Membership>> {
        self.inner.list(event_id, status)
    }
}


/// One joined member and one waitlisted user, capacity one.
async fn full_event() -> (TestContext, EventId, UserId, UserId) {
    init_test_tracing();
    let ctx = TestContext::new(now());
    let config = EventConfigBuilder::starting_in(now(), Duration::days(2))
        .max(1)
        .build();
    let event_id = ctx.register(config).await;
    let (member, waiting) = (UserId::new(), UserId::new());
    ctx.service.request_join(event_id, member).await.unwrap();
    ctx.clock.advance(Duration::seconds(1));
    ctx.service.request_join(event_id, waiting).await.unwrap();
    (ctx, event_id, member, waiting)
}

fn force_status(ctx: &TestContext, event_id: EventId, user_id: UserId, status: MembershipStatus) {
    let mut membership = ctx.memberships.get(event_id, user_id).unwrap();
    membership.status = status;
    ctx.memberships.force(membership);
}

#[tokio::test]
async fn test_lost_promotion_is_completed() {
    let (ctx, event_id, member, waiting) = full_event().await;
    // The member's leave reached both stores but the promotion never ran
    force_status(&ctx, event_id, member, MembershipStatus::Left);
    let mut capacity = ctx.capacity.get(event_id).unwrap();
    capacity.occupants.remove(&member);
    ctx.capacity.force(capacity);

    assert_eq!(ctx.service.events_with_backlog().await.unwrap(), vec![event_id]);

    let (reconciler, _shutdown) = Reconciler::new(ctx.service.clone(), std::time::Duration::from_secs(60));
    let report = reconciler.run_once().await.unwrap();

    assert_eq!(report.promoted, 1);
    assert_eq!(ctx.memberships.get(event_id, waiting).unwrap().status, MembershipStatus::Joined);
    assert!(ctx.service.events_with_backlog().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stray_occupant_is_released_and_slot_refilled() {
    let (ctx, event_id, member, waiting) = full_event().await;
    // Membership saved as left, ledger release lost
    force_status(&ctx, event_id, member, MembershipStatus::Left);
    past_grace(&ctx);

    let report = ctx.service.reconcile(event_id).await.unwrap();

    assert_eq!(report.released, 1);
    assert_eq!(report.promoted, 1);
    let capacity = ctx.capacity.get(event_id).unwrap();
    assert!(!capacity.is_occupant(member));
    assert!(capacity.is_occupant(waiting));
    assert_eq!(ctx.memberships.get(event_id, waiting).unwrap().status, MembershipStatus::Joined);
}

#[tokio::test]
async fn test_promoted_occupant_membership_is_repaired() {
    let (ctx, event_id, member, waiting) = full_event().await;
    ctx.service.leave_event(event_id, member).await.unwrap();
    // Ledger promotion committed, membership write lost
    force_status(&ctx, event_id, waiting, MembershipStatus::Waitlist);

    let report = ctx.service.reconcile(event_id).await.unwrap();

    assert_eq!(
        report,
        ReconcileReport {
            repaired: 1,
            ..ReconcileReport::default()
        }
    );
    let membership = ctx.memberships.get(event_id, waiting).unwrap();
    assert_eq!(membership.status, MembershipStatus::Joined);
}

#[tokio::test]
async fn test_stale_waitlist_entry_is_dropped() {
    let (ctx, event_id, _member, waiting) = full_event().await;
    // Membership saved as left, dequeue lost
    force_status(&ctx, event_id, waiting, MembershipStatus::Left);
    past_grace(&ctx);

    let report = ctx.service.reconcile(event_id).await.unwrap();

    assert_eq!(report.dequeued, 1);
    assert!(ctx.service.get_waitlist(event_id).await.unwrap().is_empty());
    assert_eq!(ctx.service.get_event_capacity(event_id).await.unwrap().joined_count, 1);
}

#[tokio::test]
async fn test_reconcile_twice_changes_nothing_more() {
    let (ctx, event_id, member, _waiting) = full_event().await;
    force_status(&ctx, event_id, member, MembershipStatus::Left);
    past_grace(&ctx);

    let first = ctx.service.reconcile(event_id).await.unwrap();
    let capacity = ctx.capacity.get(event_id).unwrap();
    let second = ctx.service.reconcile(event_id).await.unwrap();

    assert!(!first.is_empty());
    assert!(second.is_empty());
    assert_eq!(ctx.capacity.get(event_id).unwrap(), capacity);
}

#[tokio::test]
async fn test_consistent_event_needs_no_reconciliation() {
    let (ctx, event_id, _member, _waiting) = full_event().await;

    past_grace(&ctx);

    assert!(ctx.service.events_needing_reconcile().await.unwrap().is_empty());
    assert!(ctx.service.reconcile(event_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_manual_promotion_requires_moderator() {
    let (ctx, event_id, member, waiting) = full_event().await;
    force_status(&ctx, event_id, member, MembershipStatus::Left);
    past_grace(&ctx);

    assert_eq!(
        ctx.service.promote_from_waitlist(event_id, waiting).await,
        Err(JoinError::NotAuthorized(waiting))
    );

    let report = ctx
        .service
        .promote_from_waitlist(event_id, ctx.owner)
        .await
        .unwrap();
    assert_eq!(report.promoted, 1);
}

#[tokio::test]
async fn test_background_reconciler_repairs_and_stops() {
    let (ctx, event_id, member, waiting) = full_event().await;
    force_status(&ctx, event_id, member, MembershipStatus::Left);
    let mut capacity = ctx.capacity.get(event_id).unwrap();
    capacity.occupants.remove(&member);
    ctx.capacity.force(capacity);

    let (reconciler, shutdown) =
        Reconciler::new(ctx.service.clone(), std::time::Duration::from_millis(10));
    let handle = reconciler.spawn();

    let mut promoted = false;
    for _ in 0..100 {
        if ctx.memberships.get(event_id, waiting).unwrap().status == MembershipStatus::Joined {
            promoted = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(promoted, "reconciler should promote the waiting user");

    shutdown.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("reconciler should stop after shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_seat_without_membership_on_full_event_is_found_and_released() {
    init_test_tracing();
    let ctx = TestContext::new(now());
    let config = EventConfigBuilder::starting_in(now(), Duration::days(2))
        .max(1)
        .build();
    let event_id = ctx.register(config).await;
    // The ledger admitted a user, then the process died before the membership write
    let ledger = Ledger::new(Arc::new(ctx.capacity.clone()), test_retry_policy());
    let ghost = UserId::new();
    ledger.try_admit(event_id, ghost, now()).await.unwrap();
    let waiting = UserId::new();
    assert_eq!(
        ctx.service.request_join(event_id, waiting).await.unwrap(),
        MembershipStatus::Waitlist
    );
    assert!(ctx.service.events_with_backlog().await.unwrap().is_empty());

    let (reconciler, _shutdown) =
        Reconciler::new(ctx.service.clone(), std::time::Duration::from_secs(60));
    assert!(reconciler.run_once().await.unwrap().is_empty());

    past_grace(&ctx);
    assert_eq!(ctx.service.events_needing_reconcile().await.unwrap(), vec![event_id]);
    let report = reconciler.run_once().await.unwrap();

    assert_eq!(report.released, 1);
    assert_eq!(report.promoted, 1);
    assert_eq!(ctx.memberships.get(event_id, waiting).unwrap().status, MembershipStatus::Joined);
    assert!(!ctx.capacity.get(event_id).unwrap().is_occupant(ghost));
    assert!(ctx.service.events_needing_reconcile().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reconcile_on_another_instance_spares_admission_in_flight() {
    init_test_tracing();
    let ctx = TestContext::new(now());
    let config = EventConfigBuilder::starting_in(now(), Duration::days(2))
        .max(1)
        .build();
    let event_id = ctx.register(config).await;
    let slow = ctx.peer_service(Arc::new(SlowMembershipStore {
        inner: ctx.memberships.clone(),
        delay: std::time::Duration::from_millis(50),
    }));

    let (first, second) = (UserId::new(), UserId::new());
    let join = tokio::spawn(async move { slow.request_join(event_id, first).await });
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    // The slot is taken in the ledger, the membership write has not landed yet
    assert!(ctx.capacity.get(event_id).unwrap().is_occupant(first));
    assert!(ctx.memberships.get(event_id, first).is_none());

    let report = ctx.service.reconcile(event_id).await.unwrap();
    assert_eq!(report.released, 0);

    assert_eq!(join.await.unwrap().unwrap(), MembershipStatus::Joined);
    assert_eq!(
        ctx.service.request_join(event_id, second).await.unwrap(),
        MembershipStatus::Waitlist
    );
    let joined = ctx
        .memberships
        .list(event_id, Some(MembershipStatus::Joined))
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.user_id != ctx.owner)
        .count();
    assert_eq!(joined, 1);
    assert_eq!(ctx.service.get_event_capacity(event_id).await.unwrap().joined_count, 1);
}

#[tokio::test]
async fn test_joined_member_without_seat_gets_it_back_ahead_of_queue() {
    let (ctx, event_id, member, waiting) = full_event().await;
    // Ledger lost the seat, membership still joined
    let mut capacity = ctx.capacity.get(event_id).unwrap();
    capacity.occupants.remove(&member);
    ctx.capacity.force(capacity);

    let report = ctx.service.reconcile(event_id).await.unwrap();

    assert_eq!(
        report,
        ReconcileReport {
            readmitted: 1,
            ..ReconcileReport::default()
        }
    );
    let capacity = ctx.capacity.get(event_id).unwrap();
    assert!(capacity.is_occupant(member));
    assert_eq!(capacity.waitlist_position(waiting), Some(1));
}

#[tokio::test]
async fn test_joined_member_without_seat_on_full_event_is_waitlisted() {
    let (ctx, event_id, _member, waiting) = full_event().await;
    let extra = UserId::new();
    ctx.memberships
        .force(Membership::new(event_id, extra, MembershipStatus::Joined, now()));
    past_grace(&ctx);

    let report = ctx.service.reconcile(event_id).await.unwrap();

    assert_eq!(report.requeued, 1);
    assert_eq!(report.readmitted, 0);
    assert_eq!(ctx.memberships.get(event_id, extra).unwrap().status, MembershipStatus::Waitlist);
    let capacity = ctx.capacity.get(event_id).unwrap();
    assert_eq!(capacity.joined_count(), 1);
    assert_eq!(capacity.waitlist_position(waiting), Some(1));
    assert_eq!(capacity.waitlist_position(extra), Some(2));
}

#[tokio::test]
async fn test_waitlisted_member_missing_from_queue_is_requeued_in_order() {
    let (ctx, event_id, _member, waiting) = full_event().await;
    let lost = UserId::new();
    // Queued before `waiting`; the queue entry itself never reached the ledger
    ctx.memberships
        .force(Membership::new(event_id, lost, MembershipStatus::Waitlist, now()));

    let report = ctx.service.reconcile(event_id).await.unwrap();

    assert_eq!(
        report,
        ReconcileReport {
            requeued: 1,
            ..ReconcileReport::default()
        }
    );
    let order: Vec<UserId> = ctx
        .service
        .get_waitlist(event_id)
        .await
        .unwrap()
        .iter()
        .map(|entry| entry.user_id)
        .collect();
    assert_eq!(order, vec![lost, waiting]);
}
