//! Membership State Machine.
//!
//! Per-user status transitions within one event. The reducer is pure: it validates a
//! transition against the current record, the event configuration and the actor's
//! role, updates the record, and returns [`LedgerEffect`]s describing the occupancy
//! change the transition needs. The service executes those effects against the
//! [`Ledger`](crate::ledger::Ledger) and feeds the outcome back as an action.
//!
//! # Transitions
//!
//! ```text
//!            request (OPEN) ──admit──▶ JOINED ──leave/kick/ban──▶ LEFT/KICKED/BANNED
//!                │ full                  ▲                           │
//!                ▼                       │ promote                   │ unban
//!            WAITLIST ───────────────────┘                           ▼
//!
//!  request (REQUEST) ──▶ PENDING ──approve──▶ JOINED      BANNED ──▶ LEFT
//!                           └──reject──▶ REJECTED
//!
//!  invite ──▶ INVITED ──accept──▶ JOINED | WAITLIST
//! ```
//!
//! `LEFT`, `KICKED` and `REJECTED` are re-enterable: a new request overwrites the
//! status of the same record.

pub mod actions;
pub mod environment;
pub mod reducer;
pub mod types;

pub use actions::{LedgerEffect, MembershipAction, OnFull};
pub use environment::TransitionEnv;
pub use reducer::MembershipReducer;
pub use types::MembershipState;
