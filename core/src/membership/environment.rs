//! Read-only context of a single transition.

use crate::types::{EventJoinConfig, Role, UserId};
use crate::window::{Phase, phase_at};
use chrono::{DateTime, Utc};

/// Context for one reduction: the instant, the event configuration and who is acting.
#[derive(Clone, Debug)]
pub struct TransitionEnv {
    /// Instant of the transition
    pub now: DateTime<Utc>,
    /// Event configuration
    pub config: EventJoinConfig,
    /// User performing the action
    pub actor: UserId,
    /// The actor's role, if they are a joined member of the event
    pub actor_role: Option<Role>,
}

impl TransitionEnv {
    /// Creates a new `TransitionEnv`
    #[must_use]
    pub fn new(
        now: DateTime<Utc>,
        config: EventJoinConfig,
        actor: UserId,
        actor_role: Option<Role>,
    ) -> Self {
        Self {
            now,
            config,
            actor,
            actor_role,
        }
    }

    /// Phase of the join window at `now`
    #[must_use]
    pub fn phase(&self) -> Phase {
        phase_at(self.now, &self.config)
    }

    /// Whether the actor may moderate
    #[must_use]
    pub fn actor_can_moderate(&self) -> bool {
        self.actor_role.is_some_and(Role::can_moderate)
    }

    /// Whether the actor owns the event
    #[must_use]
    pub fn actor_is_owner(&self) -> bool {
        self.actor_role == Some(Role::Owner)
    }
}
