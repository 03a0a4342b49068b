//! State operated on by the membership reducer.

use crate::types::{EventId, Membership, MembershipStatus, Role, UserId};
use chrono::{DateTime, Utc};

/// The target user's membership in one event, possibly not yet materialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipState {
    /// Event
    pub event_id: EventId,
    /// Target user
    pub user_id: UserId,
    /// Persisted record, `None` until the first state-changing action
    pub record: Option<Membership>,
}

impl MembershipState {
    /// State for a user with no record yet
    #[must_use]
    pub const fn absent(event_id: EventId, user_id: UserId) -> Self {
        Self {
            event_id,
            user_id,
            record: None,
        }
    }

    /// State wrapping an existing record
    #[must_use]
    pub const fn from_record(record: Membership) -> Self {
        Self {
            event_id: record.event_id,
            user_id: record.user_id,
            record: Some(record),
        }
    }

    /// Current status; `None` when no record exists
    #[must_use]
    pub fn status(&self) -> MembershipStatus {
        self.record
            .as_ref()
            .map_or(MembershipStatus::None, |record| record.status)
    }

    /// Current role; participants by default
    #[must_use]
    pub fn role(&self) -> Role {
        self.record
            .as_ref()
            .map_or(Role::Participant, |record| record.role)
    }

    /// Overwrite the status of the record, creating it if needed.
    ///
    /// Restarting a flow from a re-enterable status clears the previous cycle's reason
    /// and join timestamp, and resets the role to participant.
    pub(crate) fn restart(&mut self, status: MembershipStatus, now: DateTime<Utc>) {
        let mut record = Membership::new(self.event_id, self.user_id, status, now);
        if status == MembershipStatus::Joined {
            record.joined_at = Some(now);
        }
        self.record = Some(record);
    }

    /// Update the status of the existing record (or create one), keeping its role.
    pub(crate) fn set_status(
        &mut self,
        status: MembershipStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) {
        let (event_id, user_id) = (self.event_id, self.user_id);
        let record = self
            .record
            .get_or_insert_with(|| Membership::new(event_id, user_id, status, now));
        record.status = status;
        record.reason = reason;
        record.updated_at = now;
        if status == MembershipStatus::Joined {
            record.joined_at = Some(now);
        }
    }
}
