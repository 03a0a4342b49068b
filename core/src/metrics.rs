//! Join lifecycle metrics.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `gather_admissions_total{outcome}` - Admission attempts by outcome (admitted, waitlisted, full)
//! - `gather_waitlist_enqueued_total` - Users queued on a waitlist
//! - `gather_promotions_total{trigger}` - Waitlist promotions (release, reconcile)
//! - `gather_capacity_conflicts_total` - Optimistic capacity writes that lost a race
//! - `gather_transitions_total{action,result}` - Membership transitions by action and result
//! - `gather_reconcile_runs_total` - Reconciliation passes
//!
//! Recording is a no-op until a recorder (e.g. `metrics-exporter-prometheus`) is installed.

use crate::ledger::Admission;
use metrics::{counter, describe_counter};

/// Initialize and register all metric descriptions.
///
/// Call once at startup, after installing a recorder.
pub fn register_join_metrics() {
    describe_counter!(
        "gather_admissions_total",
        "Admission attempts by outcome (admitted, waitlisted, full)"
    );
    describe_counter!(
        "gather_waitlist_enqueued_total",
        "Users placed on an event waitlist"
    );
    describe_counter!(
        "gather_promotions_total",
        "Users promoted from a waitlist into a freed slot"
    );
    describe_counter!(
        "gather_capacity_conflicts_total",
        "Optimistic capacity writes that lost a race and were retried"
    );
    describe_counter!(
        "gather_transitions_total",
        "Membership state machine transitions by action and result"
    );
    describe_counter!(
        "gather_reconcile_runs_total",
        "Reconciliation passes over events owing a promotion"
    );

    tracing::info!("Join metrics registered");
}

/// Record the outcome of an admission attempt.
pub fn record_admission(admission: Admission) {
    let outcome = match admission {
        Admission::Admitted => "admitted",
        Admission::Waitlisted { .. } => {
            counter!("gather_waitlist_enqueued_total").increment(1);
            "waitlisted"
        }
        Admission::Full => "full",
    };
    counter!("gather_admissions_total", "outcome" => outcome).increment(1);
}

/// Record a waitlist promotion.
///
/// `trigger` is `release` for inline promotions and `reconcile` for repair passes.
pub fn record_promotion(trigger: &'static str) {
    counter!("gather_promotions_total", "trigger" => trigger).increment(1);
}

/// Record a lost optimistic race.
pub fn record_capacity_conflict() {
    counter!("gather_capacity_conflicts_total").increment(1);
}

/// Record a membership transition and whether it succeeded.
pub fn record_transition(action: &'static str, result: &'static str) {
    counter!("gather_transitions_total", "action" => action, "result" => result).increment(1);
}

/// Record a reconciliation pass.
pub fn record_reconcile_run() {
    counter!("gather_reconcile_runs_total").increment(1);
}
