//! Property tests for capacity state under arbitrary operation sequences.
//!
//! Run with: `cargo test -p gather-core --test ledger_properties`

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

use chrono::Duration;
use gather_core::{Admission, CapacityState, EventId, UserId};
use gather_testing::properties::base_start;
use proptest::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum Op {
    TryAdmit(usize, i64),
    AdmitOrEnqueue(usize, i64),
    Enqueue(usize, i64),
    RemoveFromWaitlist(usize),
    Release(usize),
    PromoteNext,
    ReleaseAndPromote(usize),
}

fn arb_op(users: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..users, 0i64..600).prop_map(|(u, t)| Op::TryAdmit(u, t)),
        (0..users, 0i64..600).prop_map(|(u, t)| Op::AdmitOrEnqueue(u, t)),
        (0..users, 0i64..600).prop_map(|(u, t)| Op::Enqueue(u, t)),
        (0..users).prop_map(Op::RemoveFromWaitlist),
        (0..users).prop_map(Op::Release),
        Just(Op::PromoteNext),
        (0..users).prop_map(Op::ReleaseAndPromote),
    ]
}

fn apply(state: &mut CapacityState, users: &[UserId], op: &Op) {
    let at = |secs: i64| base_start() + Duration::seconds(secs);
    match *op {
        Op::TryAdmit(u, t) => {
            state.try_admit(users[u], at(t));
        }
        Op::AdmitOrEnqueue(u, t) => {
            state.admit_or_enqueue(users[u], at(t));
        }
        Op::Enqueue(u, t) => {
            state.enqueue(users[u], at(t));
        }
        Op::RemoveFromWaitlist(u) => {
            state.remove_from_waitlist(users[u]);
        }
        Op::Release(u) => {
            state.release(users[u]);
        }
        Op::PromoteNext => {
            state.promote_next(at(600));
        }
        Op::ReleaseAndPromote(u) => {
            state.release_and_promote(users[u], at(600));
        }
    }
}

fn check_invariants(state: &CapacityState) -> Result<(), TestCaseError> {
    if let Some(max) = state.max {
        prop_assert!(state.joined_count() <= max);
    }
    for entry in &state.waitlist {
        prop_assert!(!state.is_occupant(entry.user_id));
    }
    let queued: HashSet<UserId> = state.waitlist.iter().map(|e| e.user_id).collect();
    prop_assert_eq!(queued.len(), state.waitlist.len());
    prop_assert!(state.waitlist.windows(2).all(|pair| pair[0] < pair[1]));
    Ok(())
}

proptest! {
    #[test]
    fn invariants_hold_for_any_sequence(
        max in proptest::option::of(0u32..6),
        ops in proptest::collection::vec(arb_op(10), 0..80),
    ) {
        let users: Vec<UserId> = (0..10).map(|_| UserId::new()).collect();
        let mut state = CapacityState::new(EventId::new(), max);

        for op in &ops {
            apply(&mut state, &users, op);
            check_invariants(&state)?;
        }
    }

    #[test]
    fn admission_requires_free_slot_and_empty_queue(
        max in 0u32..6,
        ops in proptest::collection::vec(arb_op(8), 0..40),
    ) {
        let users: Vec<UserId> = (0..9).map(|_| UserId::new()).collect();
        let mut state = CapacityState::new(EventId::new(), Some(max));
        for op in &ops {
            apply(&mut state, &users[..8], op);
        }

        let newcomer = users[8];
        let admissible = state.has_free_slot() && state.waitlist.is_empty();
        let (admission, changed) = state.try_admit(newcomer, base_start());

        prop_assert_eq!(admission == Admission::Admitted, admissible);
        prop_assert_eq!(changed, admissible);
    }

    #[test]
    fn promotion_never_leaves_a_backlog(
        max in 1u32..6,
        ops in proptest::collection::vec(arb_op(10), 0..60),
    ) {
        let users: Vec<UserId> = (0..10).map(|_| UserId::new()).collect();
        let mut state = CapacityState::new(EventId::new(), Some(max));
        for op in &ops {
            apply(&mut state, &users, op);
        }

        while state.promote_next(base_start()).is_some() {}

        prop_assert!(!state.has_backlog());
        check_invariants(&state)?;
    }
}
