//! Actions and effects of the membership state machine.

use crate::types::{Role, UserId};
use serde::{Deserialize, Serialize};

/// Actions for the membership reducer.
///
/// Commands express intent from a user or moderator. Ledger outcomes are fed back
/// as the trailing event-style variants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipAction {
    // Commands
    /// Ask to join (admitted, waitlisted or pending depending on the join mode)
    Request,
    /// Join an open event, queueing if it is full
    JoinWaitlist,
    /// Withdraw a pending request or waitlist spot
    CancelRequest,
    /// Approve a pending request (owner/moderator)
    Approve,
    /// Reject a pending request (owner/moderator)
    Reject {
        /// Reason shown to the user
        reason: String,
    },
    /// Invite the user (owner/moderator)
    Invite,
    /// Accept an invitation
    AcceptInvite,
    /// Leave the event
    Leave,
    /// Leave the waitlist
    LeaveWaitlist,
    /// Remove a joined member (owner/moderator)
    Kick {
        /// Reason recorded on the membership
        reason: String,
    },
    /// Ban a joined member (owner/moderator)
    Ban {
        /// Reason recorded on the membership
        reason: String,
    },
    /// Lift a ban (owner/moderator)
    Unban,
    /// Change the role of a joined member (owner only)
    AssignRole {
        /// New role
        role: Role,
    },

    // Ledger outcomes
    /// The ledger gave the user a slot
    Admitted,
    /// The ledger queued the user
    Waitlisted,
    /// The ledger had no slot and the transition does not waitlist
    AdmissionRefused,
    /// The ledger moved the user from the waitlist into a freed slot
    Promoted,
}

impl MembershipAction {
    /// Short name for logs, metrics and errors
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::JoinWaitlist => "join_waitlist",
            Self::CancelRequest => "cancel_request",
            Self::Approve => "approve",
            Self::Reject { .. } => "reject",
            Self::Invite => "invite",
            Self::AcceptInvite => "accept_invite",
            Self::Leave => "leave",
            Self::LeaveWaitlist => "leave_waitlist",
            Self::Kick { .. } => "kick",
            Self::Ban { .. } => "ban",
            Self::Unban => "unban",
            Self::AssignRole { .. } => "assign_role",
            Self::Admitted => "admitted",
            Self::Waitlisted => "waitlisted",
            Self::AdmissionRefused => "admission_refused",
            Self::Promoted => "promoted",
        }
    }
}

/// What to do when an admission finds the event full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnFull {
    /// Queue the user on the waitlist
    Waitlist,
    /// Fail the transition with `EventFull`
    Refuse,
}

/// Occupancy changes requested by a transition, executed by the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEffect {
    /// Try to take a slot for the user
    Admit {
        /// User to admit
        user_id: UserId,
        /// Behavior when no slot is free
        on_full: OnFull,
    },
    /// Return the user's slot and promote the waitlist head into it
    Release {
        /// User whose slot is returned
        user_id: UserId,
    },
    /// Remove the user from the waitlist
    Dequeue {
        /// User to remove
        user_id: UserId,
    },
}

impl LedgerEffect {
    /// Whether the ledger runs before the membership record is persisted.
    ///
    /// Admissions commit to the ledger first; releases and dequeues run after the
    /// membership is saved. Reconciliation repairs a lost write on either side.
    #[must_use]
    pub const fn runs_before_persist(&self) -> bool {
        matches!(self, Self::Admit { .. })
    }
}
