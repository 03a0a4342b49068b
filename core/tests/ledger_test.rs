//! Capacity ledger under contention.
//!
//! Lost compare-and-swap races are injected with [`ContendedCapacityStore`]; real races
//! come from many tasks hammering one event on a multi-threaded runtime.
//!
//! Run with: `cargo test -p gather-core --test ledger_test`

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

use chrono::{Duration, TimeZone, Utc};
use gather_core::error::LedgerError;
use gather_core::retry::RetryPolicy;
use gather_core::{Admission, EventId, Ledger, UserId};
use gather_testing::{ContendedCapacityStore, InMemoryCapacityStore, test_retry_policy};
use std::sync::Arc;

fn contended(conflicts: usize) -> (Ledger, ContendedCapacityStore) {
    let store = ContendedCapacityStore::new(InMemoryCapacityStore::new(), conflicts);
    (Ledger::new(Arc::new(store.clone()), test_retry_policy()), store)
}

/// Enough retries that real contention between a few dozen tasks always resolves.
fn patient_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(200)
        .initial_delay(std::time::Duration::from_micros(50))
        .max_delay(std::time::Duration::from_millis(2))
        .build()
}

#[tokio::test]
async fn test_lost_races_are_retried_until_admitted() {
    let (ledger, store) = contended(0);
    let event_id = EventId::new();
    ledger.create(event_id, Some(1)).await.unwrap();
    store.inject_conflicts(3);

    let admission = ledger.try_admit(event_id, UserId::new(), Utc::now()).await.unwrap();

    assert_eq!(admission, Admission::Admitted);
    assert_eq!(store.save_attempts(), 4);
    assert_eq!(store.remaining_conflicts(), 0);
    assert_eq!(store.inner().get(event_id).unwrap().joined_count(), 1);
}

#[tokio::test]
async fn test_exhausted_admission_reports_full() {
    let (ledger, store) = contended(0);
    let event_id = EventId::new();
    ledger.create(event_id, Some(10)).await.unwrap();
    store.inject_conflicts(100);

    let user = UserId::new();
    let admission = ledger
        .admit_or_enqueue(event_id, user, Utc::now())
        .await
        .unwrap();

    assert_eq!(admission, Admission::Full);
    let state = store.inner().get(event_id).unwrap();
    assert!(!state.is_occupant(user));
    assert!(state.waitlist.is_empty());
    assert_eq!(store.save_attempts(), test_retry_policy().max_retries + 1);
}

#[tokio::test]
async fn test_exhausted_release_is_a_race_error() {
    let (ledger, store) = contended(0);
    let event_id = EventId::new();
    ledger.create(event_id, Some(1)).await.unwrap();
    let user = UserId::new();
    ledger.try_admit(event_id, user, Utc::now()).await.unwrap();
    store.inject_conflicts(100);

    let result = ledger.release(event_id, user).await;

    assert_eq!(result, Err(LedgerError::CapacityRace(event_id)));
    assert!(store.inner().get(event_id).unwrap().is_occupant(user));
}

#[tokio::test]
async fn test_unchanged_operations_skip_the_write() {
    let (ledger, store) = contended(0);
    let event_id = EventId::new();
    ledger.create(event_id, Some(1)).await.unwrap();

    assert!(!ledger.release(event_id, UserId::new()).await.unwrap());
    assert!(!ledger.remove_from_waitlist(event_id, UserId::new()).await.unwrap());
    assert_eq!(ledger.promote_next(event_id, Utc::now()).await.unwrap(), None);

    assert_eq!(store.save_attempts(), 0);
}

#[tokio::test]
async fn test_release_promotes_in_fifo_order() {
    let (ledger, _store) = contended(0);
    let event_id = EventId::new();
    ledger.create(event_id, Some(1)).await.unwrap();
    let base = Utc.with_ymd_and_hms(2030, 3, 1, 10, 0, 0).unwrap();

    let member = UserId::new();
    ledger.try_admit(event_id, member, Utc::now()).await.unwrap();
    let queued: Vec<UserId> = (0..3).map(|_| UserId::new()).collect();
    // Enqueue out of order; timestamps decide
    for (user, minutes) in queued.iter().zip([2, 0, 1]) {
        let admission = ledger
            .admit_or_enqueue(event_id, *user, base + Duration::minutes(minutes))
            .await
            .unwrap();
        assert!(matches!(admission, Admission::Waitlisted { .. }));
    }

    let outcome = ledger
        .release_and_promote(event_id, member, base)
        .await.unwrap();

    assert!(outcome.was_counted);
    assert_eq!(outcome.promoted, Some(queued[1]));
    let state = ledger.state(event_id).await.unwrap();
    let order: Vec<UserId> = state.waitlist.iter().map(|e| e.user_id).collect();
    assert_eq!(order, vec![queued[2], queued[0]]);
}

#[tokio::test]
async fn test_promote_next_does_not_double_promote() {
    let (ledger, _store) = contended(0);
    let event_id = EventId::new();
    ledger.create(event_id, Some(1)).await.unwrap();
    let member = UserId::new();
    ledger.try_admit(event_id, member, Utc::now()).await.unwrap();
    let waiting = UserId::new();
    ledger
        .enqueue_waitlist(event_id, waiting, Utc::now())
        .await
        .unwrap();
    ledger.release(event_id, member).await.unwrap();

    assert_eq!(ledger.promote_next(event_id, Utc::now()).await.unwrap(), Some(waiting));
    assert_eq!(ledger.promote_next(event_id, Utc::now()).await.unwrap(), None);
    assert_eq!(ledger.snapshot(event_id).await.unwrap().joined_count, 1);
}

#[tokio::test]
async fn test_enqueue_twice_keeps_one_entry() {
    let (ledger, _store) = contended(0);
    let event_id = EventId::new();
    ledger.create(event_id, Some(0)).await.unwrap();
    let user = UserId::new();
    let now = Utc::now();

    ledger.enqueue_waitlist(event_id, user, now).await.unwrap();
    ledger
        .enqueue_waitlist(event_id, user, now + Duration::seconds(5))
        .await
        .unwrap();

    let state = ledger.state(event_id).await.unwrap();
    assert_eq!(state.waitlist.len(), 1);
    assert_eq!(state.waitlist[0].enqueued_at, now);
}

#[tokio::test]
async fn test_create_twice_fails() {
    let (ledger, _store) = contended(0);
    let event_id = EventId::new();
    ledger.create(event_id, None).await.unwrap();

    assert!(matches!(
        ledger.create(event_id, None).await,
        Err(LedgerError::Store(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admissions_respect_capacity() {
    let store = InMemoryCapacityStore::new();
    let ledger = Ledger::new(Arc::new(store.clone()), patient_policy());
    let event_id = EventId::new();
    ledger.create(event_id, Some(7)).await.unwrap();

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.try_admit(event_id, UserId::new(), Utc::now()).await })
        })
        .collect();
    let admissions: Vec<Admission> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let admitted = admissions
        .iter()
        .filter(|a| **a == Admission::Admitted)
        .count();
    assert_eq!(admitted, 7);
    assert_eq!(store.get(event_id).unwrap().joined_count(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admit_or_enqueue_loses_no_one() {
    let store = InMemoryCapacityStore::new();
    let ledger = Ledger::new(Arc::new(store.clone()), patient_policy());
    let event_id = EventId::new();
    ledger.create(event_id, Some(3)).await.unwrap();

    let users: Vec<UserId> = (0..20).map(|_| UserId::new()).collect();
    let handles: Vec<_> = users
        .iter()
        .map(|user| {
            let (ledger, user) = (ledger.clone(), *user);
            tokio::spawn(async move { ledger.admit_or_enqueue(event_id, user, Utc::now()).await })
        })
        .collect();
    for handle in futures::future::join_all(handles).await {
        assert_ne!(handle.unwrap().unwrap(), Admission::Full);
    }

    let state = store.get(event_id).unwrap();
    assert_eq!(state.joined_count(), 3);
    assert_eq!(state.waitlist.len(), 17);
    for user in &users {
        assert!(state.is_occupant(*user) ^ state.waitlist_position(*user).is_some());
    }
}
