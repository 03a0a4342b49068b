//! Error types for the join lifecycle engine.
//!
//! Every error here is an expected business or contention outcome reported as a typed
//! result. Only [`JoinError::Storage`] signals an infrastructure problem.

use crate::types::{EventId, MembershipStatus, UserId};
use crate::window::Phase;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors returned to callers of the engine.
///
/// All variants are non-retryable from the caller's perspective; capacity races are
/// retried inside the ledger and never surface here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// Admission attempted with no capacity and no applicable waitlist path.
    #[error("Event {0} is full")]
    EventFull(EventId),

    /// The join window does not permit joining in the current phase.
    #[error("Join window is closed (phase: {phase})")]
    JoinWindowClosed {
        /// Phase at the time of the attempt
        phase: Phase,
    },

    /// An owner or moderator closed joining manually.
    #[error("Joining was closed manually: {reason}")]
    ManuallyClosed {
        /// Reason given by the owner/moderator
        reason: String,
    },

    /// The current status does not permit the requested transition.
    #[error("Cannot {action} while membership is {status}")]
    InvalidTransition {
        /// Transition that was attempted
        action: &'static str,
        /// Status at the time of the attempt
        status: MembershipStatus,
    },

    /// The event owner attempted to leave, or was targeted for removal.
    #[error("The event owner cannot leave or be removed")]
    OwnerCannotLeave,

    /// Duplicate request or enqueue on an already-active membership.
    #[error("User {user_id} already has an active membership ({status})")]
    AlreadyPresent {
        /// User that was already present
        user_id: UserId,
        /// Their current status
        status: MembershipStatus,
    },

    /// The actor lacks the role required for the transition.
    #[error("User {0} is not allowed to perform this action")]
    NotAuthorized(UserId),

    /// No join configuration is registered for the event.
    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    /// The event configuration violates an invariant.
    #[error("Invalid event configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Backend failure (including exhausted contention on non-admission writes).
    #[error("Storage error: {0}")]
    Storage(String),
}

impl JoinError {
    /// Short label for metrics and logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::EventFull(_) => "event_full",
            Self::JoinWindowClosed { .. } => "join_window_closed",
            Self::ManuallyClosed { .. } => "manually_closed",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::OwnerCannotLeave => "owner_cannot_leave",
            Self::AlreadyPresent { .. } => "already_present",
            Self::NotAuthorized(_) => "not_authorized",
            Self::EventNotFound(_) => "event_not_found",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Storage(_) => "storage",
        }
    }
}

/// Violations of the [`EventJoinConfig`](crate::types::EventJoinConfig) invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `end_at` must be strictly after `start_at`.
    #[error("end_at ({end_at}) must be after start_at ({start_at})")]
    EndNotAfterStart {
        /// Configured start
        start_at: DateTime<Utc>,
        /// Configured end
        end_at: DateTime<Utc>,
    },

    /// Joining must open strictly before the pre-start cutoff.
    #[error("join_opens_offset must be greater than join_cutoff_offset")]
    OpensNotBeforeCutoff,

    /// Offsets are durations and cannot be negative.
    #[error("{0} cannot be negative")]
    NegativeOffset(&'static str),

    /// Offsets are stored as whole seconds.
    #[error("{0} must be a whole number of seconds")]
    SubSecondOffset(&'static str),

    /// Applying the offset to `start_at` leaves the representable time range.
    #[error("{0} is out of range")]
    OffsetOutOfRange(&'static str),

    /// The minimum participant count must be positive.
    #[error("min must be greater than zero")]
    ZeroMinimum,

    /// The maximum participant count must not be below the minimum.
    #[error("max ({max}) must be at least min ({min})")]
    MaxBelowMin {
        /// Configured minimum
        min: u32,
        /// Configured maximum
        max: u32,
    },
}

/// Errors from the storage traits in [`crate::store`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic concurrency conflict: the stored version moved on.
    #[error("Concurrency conflict on event {event_id}: expected version {expected}, found {actual}")]
    Conflict {
        /// Event whose capacity row conflicted
        event_id: EventId,
        /// Version the writer read
        expected: u64,
        /// Version found at commit time
        actual: u64,
    },

    /// The record does not exist.
    #[error("Record not found for event {0}")]
    NotFound(EventId),

    /// A record with this key already exists.
    #[error("Record already exists for event {0}")]
    AlreadyExists(EventId),

    /// Database connection, query or decoding failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for JoinError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(event_id) => Self::EventNotFound(event_id),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Internal ledger errors.
///
/// `CapacityRace` is retried by the ledger and converted before leaving it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// An optimistic transaction lost a race against a concurrent writer.
    #[error("Capacity race on event {0}")]
    CapacityRace(EventId),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LedgerError> for JoinError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::CapacityRace(event_id) => {
                Self::Storage(format!("contention on event {event_id} did not resolve"))
            }
            LedgerError::Store(store) => store.into(),
        }
    }
}
