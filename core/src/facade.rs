//! Join Decision Facade.
//!
//! [`evaluate`] answers "can this user join right now, and what should happen if they
//! try" from the window phase, the capacity record and the user's membership. It never
//! mutates anything and is deterministic for identical inputs, so a UI may call it every
//! second for a countdown.

use crate::ledger::CapacityState;
use crate::types::{EventJoinConfig, JoinMode, Membership, MembershipStatus, Role};
use crate::window::{Phase, next_transition_at, phase_at};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Call-to-action shown to the user, in priority order of derivation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CtaLabel {
    /// The user owns the event
    Owner,
    /// The user holds a slot
    Joined,
    /// The user is queued
    Waitlisted {
        /// 1-based position, when known
        position: Option<usize>,
    },
    /// The user's request awaits approval
    Pending,
    /// The user has an open invitation
    Invited,
    /// The user's request was rejected
    Rejected,
    /// The user is banned
    Banned,
    /// An owner or moderator closed joining
    ManuallyClosed {
        /// Reason given for the closure
        reason: String,
    },
    /// Joining opens in the given number of milliseconds
    OpensIn {
        /// Milliseconds until joining opens
        ms: i64,
    },
    /// The window is closed (cutoff passed or late joining over)
    Closed,
    /// The event is over
    Ended,
    /// Full open event; trying queues the user
    JoinWaitlist,
    /// Full event without a waitlist path
    Full,
    /// Only invited users may join
    InviteOnly,
    /// Joining requires approval
    RequestToJoin,
    /// Joining admits immediately
    Join,
}

impl fmt::Display for CtaLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner => f.write_str("You're hosting"),
            Self::Joined => f.write_str("You're in"),
            Self::Waitlisted { position: Some(position) } => {
                write!(f, "On the waitlist (#{position})")
            }
            Self::Waitlisted { position: None } => f.write_str("On the waitlist"),
            Self::Pending => f.write_str("Request pending"),
            Self::Invited => f.write_str("Accept invite"),
            Self::Rejected => f.write_str("Request declined"),
            Self::Banned => f.write_str("Banned"),
            Self::ManuallyClosed { reason } => write!(f, "Joining closed: {reason}"),
            Self::OpensIn { ms } => write!(f, "Opens in {}s", ms / 1000),
            Self::Closed => f.write_str("Joining closed"),
            Self::Ended => f.write_str("Event ended"),
            Self::JoinWaitlist => f.write_str("Join waitlist"),
            Self::Full => f.write_str("Event full"),
            Self::InviteOnly => f.write_str("Invite only"),
            Self::RequestToJoin => f.write_str("Request to join"),
            Self::Join => f.write_str("Join"),
        }
    }
}

/// Everything a caller needs to render the join section of an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)] // Flags mirrored for caller convenience
pub struct JoinState {
    /// Phase of the join window
    pub phase: Phase,
    /// Whether a join attempt right now can succeed (admitted, pending or queued)
    pub can_join: bool,
    /// Call-to-action
    pub cta_label: CtaLabel,
    /// Milliseconds until joining opens, only in `BeforeOpen`
    pub opens_in_ms: Option<i64>,
    /// No free slot
    pub is_full: bool,
    /// Manual closure active
    pub is_manually_closed: bool,
    /// `phase == CutoffClosed`
    pub is_pre_cutoff_closed: bool,
    /// `phase == LateJoinOpen`
    pub is_late_join_open: bool,
    /// `phase == BeforeOpen`
    pub is_before_open: bool,
    /// Next instant at which the phase may change
    pub next_transition_at: Option<DateTime<Utc>>,
    /// The user's membership status
    pub status: MembershipStatus,
    /// The user's role, when they have a record
    pub role: Option<Role>,
    /// 1-based waitlist position, when queued
    pub waitlist_position: Option<usize>,
    /// Reason of the manual closure, when active
    pub closure_reason: Option<String>,
    /// Counted participants
    pub joined_count: u32,
    /// Maximum participants
    pub max: Option<u32>,
}

/// Statuses for which a join attempt makes no sense.
const NON_JOINABLE: [MembershipStatus; 5] = [
    MembershipStatus::Joined,
    MembershipStatus::Pending,
    MembershipStatus::Invited,
    MembershipStatus::Banned,
    MembershipStatus::Rejected,
];

/// Combine window, capacity and membership into a [`JoinState`].
#[must_use]
pub fn evaluate(
    now: DateTime<Utc>,
    config: &EventJoinConfig,
    capacity: &CapacityState,
    membership: Option<&Membership>,
) -> JoinState {
    let phase = phase_at(now, config);
    let status = membership.map_or(MembershipStatus::None, |m| m.status);
    let role = membership.map(|m| m.role);
    let is_full = capacity.is_full();
    let closure_reason = config.manual_closure.as_ref().map(|c| c.reason.clone());

    let can_join = closure_reason.is_none()
        && !NON_JOINABLE.contains(&status)
        && phase.permits_joining()
        && (!is_full || config.join_mode == JoinMode::Open);

    let opens_in_ms = (phase == Phase::BeforeOpen)
        .then(|| config.opens_at())
        .flatten()
        .map(|opens| (opens - now).num_milliseconds().max(0));

    let waitlist_position = membership
        .filter(|m| m.status == MembershipStatus::Waitlist)
        .and_then(|m| capacity.waitlist_position(m.user_id));

    let cta_label = cta_label(
        phase,
        config.join_mode,
        is_full,
        status,
        role,
        waitlist_position,
        closure_reason.as_deref(),
        opens_in_ms,
    );

    tracing::debug!(
        event_id = %config.event_id,
        %phase,
        %status,
        can_join,
        "Evaluated join state"
    );

    JoinState {
        phase,
        can_join,
        cta_label,
        opens_in_ms,
        is_full,
        is_manually_closed: closure_reason.is_some(),
        is_pre_cutoff_closed: phase == Phase::CutoffClosed,
        is_late_join_open: phase == Phase::LateJoinOpen,
        is_before_open: phase == Phase::BeforeOpen,
        next_transition_at: next_transition_at(now, config),
        status,
        role,
        waitlist_position,
        closure_reason,
        joined_count: capacity.joined_count(),
        max: capacity.max,
    }
}

/// Status labels first, then the manual closure, then phase, then capacity and mode.
#[allow(clippy::too_many_arguments)]
fn cta_label(
    phase: Phase,
    mode: JoinMode,
    is_full: bool,
    status: MembershipStatus,
    role: Option<Role>,
    waitlist_position: Option<usize>,
    closure_reason: Option<&str>,
    opens_in_ms: Option<i64>,
) -> CtaLabel {
    if role == Some(Role::Owner) && status == MembershipStatus::Joined {
        return CtaLabel::Owner;
    }

    match status {
        MembershipStatus::Joined => return CtaLabel::Joined,
        MembershipStatus::Waitlist => {
            return CtaLabel::Waitlisted {
                position: waitlist_position,
            };
        }
        MembershipStatus::Pending => return CtaLabel::Pending,
        MembershipStatus::Invited => return CtaLabel::Invited,
        MembershipStatus::Rejected => return CtaLabel::Rejected,
        MembershipStatus::Banned => return CtaLabel::Banned,
        MembershipStatus::None | MembershipStatus::Left | MembershipStatus::Kicked => {}
    }

    if let Some(reason) = closure_reason {
        return CtaLabel::ManuallyClosed {
            reason: reason.to_string(),
        };
    }

    match phase {
        Phase::BeforeOpen => {
            return CtaLabel::OpensIn {
                ms: opens_in_ms.unwrap_or(0),
            };
        }
        Phase::CutoffClosed | Phase::LateJoinClosed => return CtaLabel::Closed,
        Phase::Ended => return CtaLabel::Ended,
        Phase::Open | Phase::LateJoinOpen => {}
    }

    match (is_full, mode) {
        (true, JoinMode::Open) => CtaLabel::JoinWaitlist,
        (true, _) => CtaLabel::Full,
        (false, JoinMode::InviteOnly) => CtaLabel::InviteOnly,
        (false, JoinMode::Request) => CtaLabel::RequestToJoin,
        (false, JoinMode::Open) => CtaLabel::Join,
    }
}
