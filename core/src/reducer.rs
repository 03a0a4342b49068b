//! The Reducer trait - core abstraction for transition logic.
//!
//! Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`.
//! They validate an action, update state in place, and return descriptions of the side
//! effects the caller must execute. Results of those effects are fed back to the
//! reducer as further actions.
//!
//! A reducer that returns `Err` must leave the state untouched.

use smallvec::SmallVec;

/// Effects returned by a single reduction. Most transitions produce zero or one.
pub type Effects<E> = SmallVec<[E; 2]>;

/// The Reducer trait
///
/// # Type Parameters
///
/// - `State`: The domain state this reducer operates on
/// - `Action`: The action type this reducer processes
/// - `Environment`: Read-only context for the reduction (time, configuration, actor)
/// - `Effect`: Side effect descriptions for the caller to execute
/// - `Error`: Typed rejection of an action
pub trait Reducer {
    /// The state type this reducer operates on
    type State;

    /// The action type this reducer processes
    type Action;

    /// The environment type with injected context
    type Environment;

    /// Side effect descriptions
    type Effect;

    /// Rejection type
    type Error;

    /// Reduce an action into state changes and effects
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` when the action is not permitted in the current state; the
    /// state is then unchanged.
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> Result<Effects<Self::Effect>, Self::Error>;
}
