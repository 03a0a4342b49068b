//! Join Window Clock.
//!
//! Pure functions of the current instant and an event's temporal configuration. No
//! I/O and no mutable state: callers may evaluate them as often as they like.
//!
//! ```text
//!   opens_at        cutoff_at       start_at     late_cutoff_at       end_at
//! ─────┼───────────────┼───────────────┼───────────────┼────────────────┼──────▶
//! BEFORE_OPEN │    OPEN     │ CUTOFF_CLOSED │ LATE_JOIN_OPEN │ LATE_JOIN_CLOSED │ ENDED
//! ```
//!
//! Phases whose guarding offset is absent are skipped. The manual closure is an
//! independent override and is evaluated by the facade, not here.

use crate::types::EventJoinConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Temporal segment of an event's join window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Joining has not opened yet
    BeforeOpen,
    /// Joining is open before the start
    Open,
    /// Pre-start cutoff has passed
    CutoffClosed,
    /// Event started and late joining is allowed
    LateJoinOpen,
    /// Event started and late joining is not (or no longer) allowed
    LateJoinClosed,
    /// Event is over
    Ended,
}

impl Phase {
    /// Whether joining is temporally permitted in this phase
    #[must_use]
    pub const fn permits_joining(self) -> bool {
        matches!(self, Self::Open | Self::LateJoinOpen)
    }

    /// Position in the fixed phase order; never decreases as time advances.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::BeforeOpen => 0,
            Self::Open => 1,
            Self::CutoffClosed => 2,
            Self::LateJoinOpen => 3,
            Self::LateJoinClosed => 4,
            Self::Ended => 5,
        }
    }

    /// Stable name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BeforeOpen => "BEFORE_OPEN",
            Self::Open => "OPEN",
            Self::CutoffClosed => "CUTOFF_CLOSED",
            Self::LateJoinOpen => "LATE_JOIN_OPEN",
            Self::LateJoinClosed => "LATE_JOIN_CLOSED",
            Self::Ended => "ENDED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the phase of the join window at `now`.
///
/// First match wins:
/// 1. `now >= end_at` → `Ended`
/// 2. `now >= start_at` → `LateJoinOpen` if late joining is allowed and not past its
///    cutoff, else `LateJoinClosed`
/// 3. past the pre-start cutoff → `CutoffClosed`
/// 4. before the opening instant → `BeforeOpen`
/// 5. otherwise → `Open`
#[must_use]
pub fn phase_at(now: DateTime<Utc>, config: &EventJoinConfig) -> Phase {
    if now >= config.end_at {
        return Phase::Ended;
    }

    if now >= config.start_at {
        let late_open = config.allow_join_late
            && config.late_cutoff_at().is_none_or(|cutoff| now < cutoff);
        return if late_open {
            Phase::LateJoinOpen
        } else {
            Phase::LateJoinClosed
        };
    }

    if config.cutoff_at().is_some_and(|cutoff| now >= cutoff) {
        return Phase::CutoffClosed;
    }

    if config.opens_at().is_some_and(|opens| now < opens) {
        return Phase::BeforeOpen;
    }

    Phase::Open
}

/// All boundary instants of the window, in chronological order.
///
/// The late cutoff is omitted once it falls at or after `end_at`, where it no longer
/// changes the phase.
#[must_use]
pub fn boundaries(config: &EventJoinConfig) -> Vec<DateTime<Utc>> {
    let mut instants: Vec<DateTime<Utc>> = [
        config.opens_at(),
        config.cutoff_at(),
        Some(config.start_at),
        config.late_cutoff_at().filter(|late| *late < config.end_at),
        Some(config.end_at),
    ]
    .into_iter()
    .flatten()
    .collect();

    instants.sort_unstable();
    instants.dedup();
    instants
}

/// Earliest boundary instant strictly after `now`, if any remains.
///
/// Callers such as a countdown use it to schedule the next re-evaluation instead of
/// polling. Returns `None` once the event has ended.
#[must_use]
pub fn next_transition_at(now: DateTime<Utc>, config: &EventJoinConfig) -> Option<DateTime<Utc>> {
    boundaries(config).into_iter().find(|instant| *instant > now)
}
