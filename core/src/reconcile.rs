//! Background reconciliation.
//!
//! Inline transitions promote from the waitlist in the same ledger transaction that
//! frees a slot. When a process dies between the ledger write and the membership write,
//! an event can be left with a free slot and a non-empty waitlist, or with a ledger
//! entry that disagrees with the membership record. The [`Reconciler`] periodically runs
//! [`JoinService::reconcile`] over every event [`needs_reconcile`] flags.
//!
//! Seats and queue entries younger than the grace period belong to writes that may
//! still be in flight on another instance. They are never released or dropped; the
//! ledger re-checks their age at commit time.
//!
//! Promotions are at-least-once and idempotent: the ledger re-checks occupancy at commit
//! time, so running a pass twice never double-promotes.

use crate::error::JoinError;
use crate::ledger::CapacityState;
use crate::service::JoinService;
use crate::types::{Membership, MembershipStatus, Role, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What a reconciliation pass changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Waitlisted users moved into free slots
    pub promoted: usize,
    /// Occupants whose membership was marked joined after a lost write
    pub repaired: usize,
    /// Occupants without a joined membership whose slot was returned
    pub released: usize,
    /// Waitlist entries without a waitlisted membership that were dropped
    pub dequeued: usize,
    /// Joined members missing from the ledger who got their slot back
    pub readmitted: usize,
    /// Members missing from the ledger who were put (back) on the waitlist
    pub requeued: usize,
}

impl ReconcileReport {
    /// Whether the pass changed nothing
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.promoted == 0
            && self.repaired == 0
            && self.released == 0
            && self.dequeued == 0
            && self.readmitted == 0
            && self.requeued == 0
    }

    /// Fold another report into this one
    pub const fn merge(&mut self, other: Self) {
        self.promoted += other.promoted;
        self.repaired += other.repaired;
        self.released += other.released;
        self.dequeued += other.dequeued;
        self.readmitted += other.readmitted;
        self.requeued += other.requeued;
    }
}

/// Disagreements between one event's capacity record and its memberships.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Drift {
    /// Settled queue entries whose membership is not waitlisted
    pub dequeue: Vec<UserId>,
    /// Settled seats whose membership is neither joined nor waitlisted
    pub release: Vec<UserId>,
    /// Seats whose membership still reads waitlisted
    pub repair: Vec<UserId>,
    /// Joined participants without a seat
    pub readmit: Vec<UserId>,
    /// Waitlisted members with neither a seat nor a queue entry
    pub requeue: Vec<UserId>,
}

impl Drift {
    /// Compare a capacity record with the memberships of its event.
    #[must_use]
    pub fn detect(
        capacity: &CapacityState,
        memberships: &[Membership],
        settled_before: DateTime<Utc>,
    ) -> Self {
        let by_user: HashMap<UserId, &Membership> =
            memberships.iter().map(|m| (m.user_id, m)).collect();
        let status_of = |user_id: &UserId| {
            by_user
                .get(user_id)
                .map_or(MembershipStatus::None, |m| m.status)
        };

        let mut drift = Self {
            dequeue: capacity
                .waitlist
                .iter()
                .filter(|entry| {
                    entry.enqueued_at <= settled_before
                        && status_of(&entry.user_id) != MembershipStatus::Waitlist
                })
                .map(|entry| entry.user_id)
                .collect(),
            ..Self::default()
        };

        for (user_id, admitted_at) in &capacity.occupants {
            match status_of(user_id) {
                MembershipStatus::Joined => {}
                MembershipStatus::Waitlist => drift.repair.push(*user_id),
                _ if *admitted_at <= settled_before => drift.release.push(*user_id),
                _ => {}
            }
        }

        for membership in memberships {
            if capacity.is_occupant(membership.user_id) {
                continue;
            }
            match membership.status {
                MembershipStatus::Joined if membership.role != Role::Owner => {
                    drift.readmit.push(membership.user_id);
                }
                MembershipStatus::Waitlist
                    if capacity.waitlist_position(membership.user_id).is_none() =>
                {
                    drift.requeue.push(membership.user_id);
                }
                _ => {}
            }
        }
        drift.readmit.sort_unstable();
        drift.requeue.sort_unstable();
        drift
    }

    /// Whether the records agree
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dequeue.is_empty()
            && self.release.is_empty()
            && self.repair.is_empty()
            && self.readmit.is_empty()
            && self.requeue.is_empty()
    }
}

/// Whether an event owes a promotion or its records disagree.
#[must_use]
pub fn needs_reconcile(
    capacity: &CapacityState,
    memberships: &[Membership],
    settled_before: DateTime<Utc>,
) -> bool {
    capacity.has_backlog() || !Drift::detect(capacity, memberships, settled_before).is_empty()
}

/// Periodic reconciliation task.
pub struct Reconciler {
    service: Arc<JoinService>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Reconciler {
    /// Create a reconciler.
    ///
    /// Returns the reconciler and a shutdown sender. Send `true` to stop it after the
    /// current pass.
    #[must_use]
    pub fn new(service: Arc<JoinService>, interval: Duration) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = Self {
            service,
            interval,
            shutdown: shutdown_rx,
        };
        (reconciler, shutdown_tx)
    }

    /// Reconcile every flagged event once.
    ///
    /// A failing event is logged and skipped; the remaining events are still processed.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the index query itself fails.
    pub async fn run_once(&self) -> Result<ReconcileReport, JoinError> {
        let events = self.service.events_needing_reconcile().await?;
        let mut total = ReconcileReport::default();

        for event_id in events {
            match self.service.reconcile(event_id).await {
                Ok(report) => total.merge(report),
                Err(error) => {
                    tracing::error!(%event_id, %error, "Reconciliation failed for event");
                }
            }
        }
        Ok(total)
    }

    /// Run passes on the configured interval until shutdown is signalled.
    pub async fn run(mut self) {
        tracing::info!(interval_ms = self.interval.as_millis(), "Starting reconciler");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*self.shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if !report.is_empty() => {
                            tracing::info!(?report, "Reconciler pass repaired events");
                        }
                        Ok(_) => tracing::debug!("Reconciler pass found nothing to do"),
                        Err(error) => tracing::error!(%error, "Reconciler pass failed"),
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        // Sender dropped
                        break;
                    }
                }
            }
        }

        tracing::info!("Reconciler stopped");
    }

    /// Run on a background task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
