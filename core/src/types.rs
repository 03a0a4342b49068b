//! Domain types for the join lifecycle engine.
//!
//! Value objects and entities shared by the window clock, the capacity ledger and the
//! membership state machine.

use crate::error::ConfigError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for an event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random `EventId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `EventId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a user.
///
/// Ordered so waitlist ties on `enqueued_at` resolve deterministically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Creates a new random `UserId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `UserId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Event configuration
// ============================================================================

/// How join requests are accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinMode {
    /// Requests are admitted immediately (or waitlisted when full)
    Open,
    /// Requests wait for owner/moderator approval
    Request,
    /// Only invited users may join
    InviteOnly,
}

impl JoinMode {
    /// Stable storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Request => "REQUEST",
            Self::InviteOnly => "INVITE_ONLY",
        }
    }

    /// Parse the storage representation
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OPEN" => Some(Self::Open),
            "REQUEST" => Some(Self::Request),
            "INVITE_ONLY" => Some(Self::InviteOnly),
            _ => None,
        }
    }
}

impl fmt::Display for JoinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner/moderator override that closes joining regardless of the window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualClosure {
    /// Free-text reason surfaced to users
    pub reason: String,
    /// When the event was closed
    pub closed_at: DateTime<Utc>,
    /// Who closed it
    pub closed_by: UserId,
}

/// Temporal, capacity and policy configuration of an event.
///
/// Owned by the event aggregate; the engine only reads it, except for the manual
/// closure which owners and moderators toggle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventJoinConfig {
    /// Event this configuration belongs to
    pub event_id: EventId,
    /// When the event starts
    pub start_at: DateTime<Utc>,
    /// When the event ends (strictly after `start_at`)
    pub end_at: DateTime<Utc>,
    /// Joining opens this long before `start_at`
    #[serde(with = "offset_seconds")]
    pub join_opens_offset: Option<Duration>,
    /// Joining closes this long before `start_at`
    #[serde(with = "offset_seconds")]
    pub join_cutoff_offset: Option<Duration>,
    /// Whether users may join after the start
    pub allow_join_late: bool,
    /// Late joining closes this long after `start_at` (only with `allow_join_late`)
    #[serde(with = "offset_seconds")]
    pub late_join_cutoff_offset: Option<Duration>,
    /// Active manual closure, if any
    pub manual_closure: Option<ManualClosure>,
    /// Admission policy
    pub join_mode: JoinMode,
    /// Minimum participants (informational, strictly positive)
    pub min: u32,
    /// Maximum participants; `None` means uncapped
    pub max: Option<u32>,
}

impl EventJoinConfig {
    /// Create a configuration with an open window spanning `start_at..end_at`.
    #[must_use]
    pub fn new(
        event_id: EventId,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        join_mode: JoinMode,
        max: Option<u32>,
    ) -> Self {
        Self {
            event_id,
            start_at,
            end_at,
            join_opens_offset: None,
            join_cutoff_offset: None,
            allow_join_late: false,
            late_join_cutoff_offset: None,
            manual_closure: None,
            join_mode,
            min: 1,
            max,
        }
    }

    /// Whether an owner/moderator closure is active
    #[must_use]
    pub const fn is_manually_closed(&self) -> bool {
        self.manual_closure.is_some()
    }

    /// Instant at which joining opens, when an opening offset is configured.
    ///
    /// Saturates at the earliest representable instant.
    #[must_use]
    pub fn opens_at(&self) -> Option<DateTime<Utc>> {
        self.join_opens_offset.map(|offset| before(self.start_at, offset))
    }

    /// Instant at which pre-start joining closes, when a cutoff is configured
    #[must_use]
    pub fn cutoff_at(&self) -> Option<DateTime<Utc>> {
        self.join_cutoff_offset.map(|offset| before(self.start_at, offset))
    }

    /// Instant at which late joining closes, when late joining is allowed and bounded
    #[must_use]
    pub fn late_cutoff_at(&self) -> Option<DateTime<Utc>> {
        if !self.allow_join_late {
            return None;
        }
        self.late_join_cutoff_offset.map(|offset| {
            self.start_at
                .checked_add_signed(offset)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }

    /// Check the invariants of the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.end_at <= self.start_at {
            return Err(ConfigError::EndNotAfterStart {
                start_at: self.start_at,
                end_at: self.end_at,
            });
        }

        for (name, offset) in [
            ("join_opens_offset", self.join_opens_offset),
            ("join_cutoff_offset", self.join_cutoff_offset),
            ("late_join_cutoff_offset", self.late_join_cutoff_offset),
        ] {
            let Some(offset) = offset else { continue };
            if offset < Duration::zero() {
                return Err(ConfigError::NegativeOffset(name));
            }
            if offset.subsec_nanos() != 0 {
                return Err(ConfigError::SubSecondOffset(name));
            }
        }

        let late_in_range = self
            .late_join_cutoff_offset
            .is_none_or(|offset| self.start_at.checked_add_signed(offset).is_some());
        for (name, in_range) in [
            ("join_opens_offset", fits_before(self.start_at, self.join_opens_offset)),
            ("join_cutoff_offset", fits_before(self.start_at, self.join_cutoff_offset)),
            ("late_join_cutoff_offset", late_in_range),
        ] {
            if !in_range {
                return Err(ConfigError::OffsetOutOfRange(name));
            }
        }

        if let (Some(opens), Some(cutoff)) = (self.join_opens_offset, self.join_cutoff_offset) {
            if opens <= cutoff {
                return Err(ConfigError::OpensNotBeforeCutoff);
            }
        }

        if self.min == 0 {
            return Err(ConfigError::ZeroMinimum);
        }

        if let Some(max) = self.max {
            if max < self.min {
                return Err(ConfigError::MaxBelowMin { min: self.min, max });
            }
        }

        Ok(())
    }
}

fn before(start_at: DateTime<Utc>, offset: Duration) -> DateTime<Utc> {
    start_at
        .checked_sub_signed(offset)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn fits_before(start_at: DateTime<Utc>, offset: Option<Duration>) -> bool {
    offset.is_none_or(|offset| start_at.checked_sub_signed(offset).is_some())
}

/// Offsets are persisted as whole seconds.
mod offset_seconds {
    use chrono::Duration;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)] // serde `with` passes a reference to the field
    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(offset) => serializer.serialize_some(&offset.num_seconds()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<i64>::deserialize(deserializer)?
            .map(|secs| {
                Duration::try_seconds(secs)
                    .ok_or_else(|| D::Error::custom(format!("offset of {secs} seconds is out of range")))
            })
            .transpose()
    }
}

// ============================================================================
// Membership
// ============================================================================

/// Status of a user's membership in an event.
///
/// `None` stands for the absence of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipStatus {
    /// No record exists
    None,
    /// Awaiting approval
    Pending,
    /// Invited, not yet accepted
    Invited,
    /// Counted participant
    Joined,
    /// Queued for a free slot
    Waitlist,
    /// Request rejected
    Rejected,
    /// Banned from the event
    Banned,
    /// Left voluntarily (or cancelled)
    Left,
    /// Removed by an owner/moderator
    Kicked,
}

impl MembershipStatus {
    /// Stable storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Pending => "PENDING",
            Self::Invited => "INVITED",
            Self::Joined => "JOINED",
            Self::Waitlist => "WAITLIST",
            Self::Rejected => "REJECTED",
            Self::Banned => "BANNED",
            Self::Left => "LEFT",
            Self::Kicked => "KICKED",
        }
    }

    /// Parse the storage representation
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NONE" => Some(Self::None),
            "PENDING" => Some(Self::Pending),
            "INVITED" => Some(Self::Invited),
            "JOINED" => Some(Self::Joined),
            "WAITLIST" => Some(Self::Waitlist),
            "REJECTED" => Some(Self::Rejected),
            "BANNED" => Some(Self::Banned),
            "LEFT" => Some(Self::Left),
            "KICKED" => Some(Self::Kicked),
            _ => None,
        }
    }

    /// Statuses from which a fresh join request may start
    #[must_use]
    pub const fn can_request(self) -> bool {
        matches!(self, Self::None | Self::Left | Self::Rejected | Self::Kicked)
    }

    /// Statuses that represent an in-flight or completed membership
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Invited | Self::Joined | Self::Waitlist
        )
    }
}

impl fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a member within an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Creator of the event; exactly one per event
    Owner,
    /// May approve, invite, kick and ban
    Moderator,
    /// Regular participant
    Participant,
}

impl Role {
    /// Whether this role may perform moderation transitions
    #[must_use]
    pub const fn can_moderate(self) -> bool {
        matches!(self, Self::Owner | Self::Moderator)
    }

    /// Stable storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "OWNER",
            Self::Moderator => "MODERATOR",
            Self::Participant => "PARTICIPANT",
        }
    }

    /// Parse the storage representation
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OWNER" => Some(Self::Owner),
            "MODERATOR" => Some(Self::Moderator),
            "PARTICIPANT" => Some(Self::Participant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user's membership in one event.
///
/// Never physically deleted: re-entry overwrites the status of the same record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// Event
    pub event_id: EventId,
    /// User
    pub user_id: UserId,
    /// Current status (never `None` once a record exists)
    pub status: MembershipStatus,
    /// Role in the event
    pub role: Role,
    /// Reason attached to rejections, bans and kicks
    pub reason: Option<String>,
    /// When the user last became `Joined`
    pub joined_at: Option<DateTime<Utc>>,
    /// Last transition
    pub updated_at: DateTime<Utc>,
}

impl Membership {
    /// Create a participant record with the given status
    #[must_use]
    pub fn new(
        event_id: EventId,
        user_id: UserId,
        status: MembershipStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            user_id,
            status,
            role: Role::Participant,
            reason: None,
            joined_at: None,
            updated_at: now,
        }
    }

    /// Create the owner record assigned at event creation
    #[must_use]
    pub fn owner(event_id: EventId, user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            event_id,
            user_id,
            status: MembershipStatus::Joined,
            role: Role::Owner,
            reason: None,
            joined_at: Some(now),
            updated_at: now,
        }
    }

    /// Whether this record belongs to the event owner
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.role == Role::Owner
    }
}

/// Read-only capacity view exposed to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    /// Counted participants
    pub joined_count: u32,
    /// Maximum participants (`None` = uncapped)
    pub max: Option<u32>,
    /// Users currently queued
    pub waitlist_length: u32,
}
