//! Membership reducer flows in Given-When-Then form.
//!
//! Run with: `cargo test -p gather-core --test membership_reducer_test`

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

use chrono::{DateTime, Duration, TimeZone, Utc};
use gather_core::membership::{
    LedgerEffect, MembershipAction, MembershipReducer, MembershipState, OnFull, TransitionEnv,
};
use gather_core::{
    EventId, EventJoinConfig, JoinError, JoinMode, Membership, MembershipStatus, Phase, Role,
    UserId,
};
use gather_testing::reducer_test::assertions::assert_no_effects;
use gather_testing::{EventConfigBuilder, ReducerTest};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 9, 10, 12, 0, 0).unwrap()
}

fn config(mode: JoinMode) -> EventJoinConfig {
    EventConfigBuilder::starting_in(now(), Duration::days(3))
        .mode(mode)
        .max(4)
        .build()
}

fn as_self(config: EventJoinConfig, user: UserId) -> TransitionEnv {
    TransitionEnv::new(now(), config, user, None)
}

fn as_owner(config: EventJoinConfig) -> TransitionEnv {
    TransitionEnv::new(now(), config, UserId::new(), Some(Role::Owner))
}

fn record(event_id: EventId, user: UserId, status: MembershipStatus) -> MembershipState {
    MembershipState::from_record(Membership::new(event_id, user, status, now() - Duration::days(1)))
}

#[test]
fn test_open_request_asks_ledger_then_joins() {
    let config = config(JoinMode::Open);
    let (event_id, user) = (config.event_id, UserId::new());

    ReducerTest::new(MembershipReducer::new())
        .with_env(as_self(config, user))
        .given_state(MembershipState::absent(event_id, user))
        .when_action(MembershipAction::Request)
        .then_state(|state| assert_eq!(state.status(), MembershipStatus::None))
        .then_effects(move |effects| {
            assert_eq!(
                effects,
                [LedgerEffect::Admit {
                    user_id: user,
                    on_full: OnFull::Waitlist
                }]
            );
        })
        .run();
}

#[test]
fn test_waitlisted_then_promoted() {
    let config = config(JoinMode::Open);
    let (event_id, user) = (config.event_id, UserId::new());

    ReducerTest::new(MembershipReducer::new())
        .with_env(as_self(config, user))
        .given_state(MembershipState::absent(event_id, user))
        .when_action(MembershipAction::Request)
        .when_action(MembershipAction::Waitlisted)
        .when_action(MembershipAction::Promoted)
        .then_state(|state| {
            let record = state.record.as_ref().unwrap();
            assert_eq!(record.status, MembershipStatus::Joined);
            assert_eq!(record.joined_at, Some(now()));
        })
        .then_effects(|effects| assert_no_effects(effects))
        .run();
}

#[test]
fn test_request_mode_goes_pending_without_ledger() {
    let config = config(JoinMode::Request);
    let (event_id, user) = (config.event_id, UserId::new());

    ReducerTest::new(MembershipReducer::new())
        .with_env(as_self(config, user))
        .given_state(MembershipState::absent(event_id, user))
        .when_action(MembershipAction::Request)
        .then_state(|state| assert_eq!(state.status(), MembershipStatus::Pending))
        .then_effects(|effects| assert_no_effects(effects))
        .run();
}

#[test]
fn test_approval_refused_when_full_keeps_pending() {
    let config = config(JoinMode::Request);
    let (event_id, user) = (config.event_id, UserId::new());

    ReducerTest::new(MembershipReducer::new())
        .with_env(as_owner(config))
        .given_state(record(event_id, user, MembershipStatus::Pending))
        .when_action(MembershipAction::Approve)
        .when_action(MembershipAction::AdmissionRefused)
        .then_error(move |error| assert_eq!(*error, JoinError::EventFull(event_id)))
        .then_state(|state| assert_eq!(state.status(), MembershipStatus::Pending))
        .run();
}

#[test]
fn test_invite_accept_flow() {
    let config = config(JoinMode::InviteOnly);
    let (event_id, user) = (config.event_id, UserId::new());

    ReducerTest::new(MembershipReducer::new())
        .with_env(as_owner(config.clone()))
        .given_state(MembershipState::absent(event_id, user))
        .when_action(MembershipAction::Invite)
        .then_state(|state| assert_eq!(state.status(), MembershipStatus::Invited))
        .run();

    ReducerTest::new(MembershipReducer::new())
        .with_env(as_self(config, user))
        .given_state(record(event_id, user, MembershipStatus::Invited))
        .when_action(MembershipAction::AcceptInvite)
        .when_action(MembershipAction::Admitted)
        .then_state(|state| assert_eq!(state.status(), MembershipStatus::Joined))
        .run();
}

#[test]
fn test_request_after_cutoff_is_rejected_unchanged() {
    let config = EventConfigBuilder::starting_in(now(), Duration::minutes(20))
        .cutoff_before(Duration::hours(1))
        .build();
    let (event_id, user) = (config.event_id, UserId::new());

    ReducerTest::new(MembershipReducer::new())
        .with_env(as_self(config, user))
        .given_state(record(event_id, user, MembershipStatus::Left))
        .when_action(MembershipAction::Request)
        .then_error(|error| {
            assert_eq!(
                *error,
                JoinError::JoinWindowClosed {
                    phase: Phase::CutoffClosed
                }
            );
        })
        .run();
}

#[test]
fn test_leave_releases_slot() {
    let config = config(JoinMode::Open);
    let (event_id, user) = (config.event_id, UserId::new());

    ReducerTest::new(MembershipReducer::new())
        .with_env(as_self(config, user))
        .given_state(record(event_id, user, MembershipStatus::Joined))
        .when_action(MembershipAction::Leave)
        .then_state(|state| assert_eq!(state.status(), MembershipStatus::Left))
        .then_effects(move |effects| {
            assert_eq!(effects, [LedgerEffect::Release { user_id: user }]);
        })
        .run();
}

#[test]
fn test_kick_records_reason() {
    let config = config(JoinMode::Open);
    let (event_id, user) = (config.event_id, UserId::new());

    ReducerTest::new(MembershipReducer::new())
        .with_env(as_owner(config))
        .given_state(record(event_id, user, MembershipStatus::Joined))
        .when_action(MembershipAction::Kick {
            reason: "spam".to_string(),
        })
        .then_state(|state| {
            let record = state.record.as_ref().unwrap();
            assert_eq!(record.status, MembershipStatus::Kicked);
            assert_eq!(record.reason.as_deref(), Some("spam"));
            assert_eq!(record.updated_at, now());
        })
        .run();
}
