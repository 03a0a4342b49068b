//! Reducer for the membership state machine.

use crate::error::JoinError;
use crate::membership::{LedgerEffect, MembershipAction, MembershipState, OnFull, TransitionEnv};
use crate::reducer::{Effects, Reducer};
use crate::types::{JoinMode, MembershipStatus, Role};
use smallvec::smallvec;

/// Reducer for per-user membership transitions.
///
/// Every rejected transition returns a typed [`JoinError`] and leaves the state as it
/// was; no transition leaves a record in an undefined status.
#[derive(Clone, Copy, Debug, Default)]
pub struct MembershipReducer;

impl MembershipReducer {
    /// Creates a new `MembershipReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn invalid(action: &MembershipAction, status: MembershipStatus) -> JoinError {
        JoinError::InvalidTransition {
            action: action.name(),
            status,
        }
    }

    fn require_self(state: &MembershipState, env: &TransitionEnv) -> Result<(), JoinError> {
        if env.actor == state.user_id {
            Ok(())
        } else {
            Err(JoinError::NotAuthorized(env.actor))
        }
    }

    fn require_moderator(env: &TransitionEnv) -> Result<(), JoinError> {
        if env.actor_can_moderate() {
            Ok(())
        } else {
            Err(JoinError::NotAuthorized(env.actor))
        }
    }

    /// Manual closure first, then the temporal phase.
    fn require_open_window(env: &TransitionEnv) -> Result<(), JoinError> {
        if let Some(closure) = &env.config.manual_closure {
            return Err(JoinError::ManuallyClosed {
                reason: closure.reason.clone(),
            });
        }
        let phase = env.phase();
        if phase.permits_joining() {
            Ok(())
        } else {
            Err(JoinError::JoinWindowClosed { phase })
        }
    }

    /// Shared preconditions of `Request` and `JoinWaitlist`.
    fn require_can_start(
        action: &MembershipAction,
        state: &MembershipState,
        env: &TransitionEnv,
    ) -> Result<(), JoinError> {
        Self::require_self(state, env)?;

        let status = state.status();
        if status.is_active() {
            return Err(JoinError::AlreadyPresent {
                user_id: state.user_id,
                status,
            });
        }
        if !status.can_request() {
            return Err(Self::invalid(action, status));
        }

        let mode_allows = match action {
            MembershipAction::JoinWaitlist => env.config.join_mode == JoinMode::Open,
            _ => env.config.join_mode != JoinMode::InviteOnly,
        };
        if !mode_allows {
            return Err(Self::invalid(action, status));
        }

        Self::require_open_window(env)
    }

    /// Preconditions of `Kick` and `Ban`: the owner is untouchable and only the owner
    /// removes moderators.
    fn require_removable(state: &MembershipState, env: &TransitionEnv) -> Result<(), JoinError> {
        Self::require_moderator(env)?;
        match state.role() {
            Role::Owner => Err(JoinError::OwnerCannotLeave),
            Role::Moderator if !env.actor_is_owner() => Err(JoinError::NotAuthorized(env.actor)),
            _ => Ok(()),
        }
    }
}

impl Reducer for MembershipReducer {
    type State = MembershipState;
    type Action = MembershipAction;
    type Environment = TransitionEnv;
    type Effect = LedgerEffect;
    type Error = JoinError;

    #[allow(clippy::too_many_lines)] // One arm per transition reads best as a single match
    fn reduce(
        &self,
        state: &mut MembershipState,
        action: MembershipAction,
        env: &TransitionEnv,
    ) -> Result<Effects<LedgerEffect>, JoinError> {
        let status = state.status();
        let user_id = state.user_id;
        let now = env.now;

        match action {
            MembershipAction::Request => {
                Self::require_can_start(&action, state, env)?;
                match env.config.join_mode {
                    JoinMode::Open => Ok(smallvec![LedgerEffect::Admit {
                        user_id,
                        on_full: OnFull::Waitlist,
                    }]),
                    _ => {
                        state.restart(MembershipStatus::Pending, now);
                        Ok(Effects::new())
                    }
                }
            }

            MembershipAction::JoinWaitlist => {
                Self::require_can_start(&action, state, env)?;
                Ok(smallvec![LedgerEffect::Admit {
                    user_id,
                    on_full: OnFull::Waitlist,
                }])
            }

            MembershipAction::CancelRequest => {
                Self::require_self(state, env)?;
                match status {
                    MembershipStatus::Pending => {
                        state.set_status(MembershipStatus::Left, None, now);
                        Ok(Effects::new())
                    }
                    MembershipStatus::Waitlist => {
                        state.set_status(MembershipStatus::Left, None, now);
                        Ok(smallvec![LedgerEffect::Dequeue { user_id }])
                    }
                    // Never materialized: clear any stray queue entry, keep no record.
                    MembershipStatus::None => Ok(smallvec![LedgerEffect::Dequeue { user_id }]),
                    MembershipStatus::Left => Ok(Effects::new()),
                    _ => Err(Self::invalid(&action, status)),
                }
            }

            MembershipAction::Approve => {
                Self::require_moderator(env)?;
                if status != MembershipStatus::Pending {
                    return Err(Self::invalid(&action, status));
                }
                Ok(smallvec![LedgerEffect::Admit {
                    user_id,
                    on_full: OnFull::Refuse,
                }])
            }

            MembershipAction::Reject { ref reason } => {
                Self::require_moderator(env)?;
                if status != MembershipStatus::Pending {
                    return Err(Self::invalid(&action, status));
                }
                state.set_status(MembershipStatus::Rejected, Some(reason.clone()), now);
                Ok(Effects::new())
            }

            MembershipAction::Invite => {
                Self::require_moderator(env)?;
                match status {
                    MembershipStatus::None | MembershipStatus::Left => {
                        state.restart(MembershipStatus::Invited, now);
                        Ok(Effects::new())
                    }
                    active if active.is_active() => Err(JoinError::AlreadyPresent {
                        user_id,
                        status: active,
                    }),
                    _ => Err(Self::invalid(&action, status)),
                }
            }

            MembershipAction::AcceptInvite => {
                Self::require_self(state, env)?;
                if status != MembershipStatus::Invited {
                    return Err(Self::invalid(&action, status));
                }
                Ok(smallvec![LedgerEffect::Admit {
                    user_id,
                    on_full: OnFull::Waitlist,
                }])
            }

            MembershipAction::Leave => {
                Self::require_self(state, env)?;
                if state.role() == Role::Owner {
                    return Err(JoinError::OwnerCannotLeave);
                }
                if status != MembershipStatus::Joined {
                    return Err(Self::invalid(&action, status));
                }
                state.set_status(MembershipStatus::Left, None, now);
                Ok(smallvec![LedgerEffect::Release { user_id }])
            }

            MembershipAction::LeaveWaitlist => {
                Self::require_self(state, env)?;
                if status != MembershipStatus::Waitlist {
                    return Err(Self::invalid(&action, status));
                }
                state.set_status(MembershipStatus::Left, None, now);
                Ok(smallvec![LedgerEffect::Dequeue { user_id }])
            }

            MembershipAction::Kick { ref reason } | MembershipAction::Ban { ref reason } => {
                Self::require_removable(state, env)?;
                if status != MembershipStatus::Joined {
                    return Err(Self::invalid(&action, status));
                }
                let next = if matches!(action, MembershipAction::Kick { .. }) {
                    MembershipStatus::Kicked
                } else {
                    MembershipStatus::Banned
                };
                state.set_status(next, Some(reason.clone()), now);
                Ok(smallvec![LedgerEffect::Release { user_id }])
            }

            MembershipAction::Unban => {
                Self::require_moderator(env)?;
                if status != MembershipStatus::Banned {
                    return Err(Self::invalid(&action, status));
                }
                state.set_status(MembershipStatus::Left, None, now);
                Ok(Effects::new())
            }

            MembershipAction::AssignRole { role } => {
                if !env.actor_is_owner() {
                    return Err(JoinError::NotAuthorized(env.actor));
                }
                if state.role() == Role::Owner {
                    return Err(JoinError::OwnerCannotLeave);
                }
                if role == Role::Owner || status != MembershipStatus::Joined {
                    return Err(Self::invalid(&action, status));
                }
                if let Some(record) = state.record.as_mut() {
                    record.role = role;
                    record.updated_at = now;
                }
                Ok(Effects::new())
            }

            MembershipAction::Admitted => {
                match status {
                    MembershipStatus::Joined => {}
                    restartable if restartable.can_request() => {
                        state.restart(MembershipStatus::Joined, now);
                    }
                    _ => state.set_status(MembershipStatus::Joined, None, now),
                }
                Ok(Effects::new())
            }

            MembershipAction::Waitlisted => {
                match status {
                    MembershipStatus::Waitlist => {}
                    restartable if restartable.can_request() => {
                        state.restart(MembershipStatus::Waitlist, now);
                    }
                    _ => state.set_status(MembershipStatus::Waitlist, None, now),
                }
                Ok(Effects::new())
            }

            MembershipAction::AdmissionRefused => Err(JoinError::EventFull(state.event_id)),

            MembershipAction::Promoted => match status {
                MembershipStatus::Joined => Ok(Effects::new()),
                MembershipStatus::Waitlist | MembershipStatus::None => {
                    state.set_status(MembershipStatus::Joined, None, now);
                    Ok(Effects::new())
                }
                _ => Err(Self::invalid(&action, status)),
            },
        }
    }
}
