//! # Gather Core
//!
//! Event join lifecycle engine: who may join an event, when, and what happens when it
//! is full.
//!
//! ## Components
//!
//! - **Join Window Clock** ([`window`]): pure phase computation from the current instant
//!   and an event's temporal configuration
//! - **Capacity & Waitlist Ledger** ([`ledger`]): the only writer of joined counts and
//!   waitlists, race-safe through optimistic version checks
//! - **Membership State Machine** ([`membership`]): a pure reducer over per-user status
//!   transitions emitting ledger effects
//! - **Join Decision Facade** ([`facade`]): read-only `evaluate` combining the three
//!
//! [`JoinService`] wires them to storage ([`store`]) and serializes writes per event;
//! [`Reconciler`] repairs interrupted promotions in the background.
//!
//! ## Architecture Principles
//!
//! - Functional Core, Imperative Shell
//! - Explicit effects: reducers describe ledger changes, the service executes them
//! - Dependency injection through [`JoinEnvironment`]
//!
//! ## Example
//!
//! ```
//! use gather_core::window::{Phase, phase_at};
//! use gather_core::{EventId, EventJoinConfig, JoinMode};
//! use chrono::{Duration, Utc};
//!
//! let start = Utc::now() + Duration::hours(1);
//! let mut config = EventJoinConfig::new(
//!     EventId::new(),
//!     start,
//!     start + Duration::hours(2),
//!     JoinMode::Open,
//!     Some(20),
//! );
//! config.join_cutoff_offset = Some(Duration::minutes(30));
//!
//! assert_eq!(phase_at(start - Duration::minutes(10), &config), Phase::CutoffClosed);
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod facade;
pub mod ledger;
pub mod membership;
pub mod metrics;
pub mod reconcile;
pub mod reducer;
pub mod retry;
pub mod service;
pub mod store;
pub mod types;
pub mod window;

pub use config::EngineConfig;
pub use environment::{Clock, SystemClock};
pub use error::{ConfigError, JoinError, LedgerError, StoreError};
pub use facade::{CtaLabel, JoinState, evaluate};
pub use ledger::{Admission, CapacityState, Ledger, WaitlistEntry};
pub use reconcile::{Drift, ReconcileReport, Reconciler, needs_reconcile};
pub use reducer::Reducer;
pub use service::{JoinEnvironment, JoinService};
pub use store::ReconcileIndex;
pub use types::{
    CapacitySnapshot, EventId, EventJoinConfig, JoinMode, ManualClosure, Membership,
    MembershipStatus, Role, UserId,
};
pub use window::Phase;
