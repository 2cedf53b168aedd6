//! # Racetrack Core
//!
//! Core traits and types for the racetrack race engine.
//!
//! A race session is modelled as a reducer: every command (join, ready, finish,
//! forfeit, ...) and every timer firing is an action, the reducer mutates the
//! session state in place and returns descriptions of the side effects it wants
//! performed. The runtime crate executes those descriptions.
//!
//! ## Core Concepts
//!
//! - **State**: The session being reduced (teams, entrants, timers)
//! - **Action**: All possible inputs to a reducer (commands and timer/persistence feedback)
//! - **Reducer**: `(State, Action, Environment) → (State, Effects)`
//! - **Effect**: Side effect descriptions (timers, cancellation, async work)
//! - **Environment**: Injected dependencies via traits (clock, stores, announcers)
//!
//! ## Example
//!
//! ```ignore
//! use racetrack_core::*;
//!
//! impl Reducer for RaceReducer {
//!     type State = SessionState;
//!     type Action = RaceAction;
//!     type Environment = RaceEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut SessionState,
//!         action: RaceAction,
//!         env: &RaceEnvironment,
//!     ) -> SmallVec<[Effect<RaceAction>; 4]> {
//!         // Session logic goes here
//!         SmallVec::new()
//!     }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{smallvec, SmallVec};

/// Reducer module - The core trait for session logic
///
/// Reducers are deterministic: given the same state, action and environment
/// readings they produce the same state and the same effect descriptions.
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for session logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// 1. Validates the action against the current state
        /// 2. Updates state in place
        /// 3. Returns effect descriptions to be executed by the runtime
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects are values, not execution. A reducer returns them and the Store
/// runtime decides how to run them. Timers are expressed as [`Effect::Delay`]
/// and grouped under an [`EffectId`] with [`Effect::Cancellable`] so a later
/// [`Effect::Cancel`] can abort the whole group.
pub mod effect {
    use std::borrow::Cow;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Identifier for a cancellable group of effects
    ///
    /// Identifiers are scoped to a single Store: two stores may both use
    /// `"countdown"` without interfering.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct EffectId(Cow<'static, str>);

    impl EffectId {
        /// Create an identifier from a static name
        #[must_use]
        pub const fn from_static(name: &'static str) -> Self {
            Self(Cow::Borrowed(name))
        }

        /// Create an identifier from an owned name
        #[must_use]
        pub fn new(name: impl Into<String>) -> Self {
            Self(Cow::Owned(name.into()))
        }

        /// The identifier's name
        #[must_use]
        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl std::fmt::Display for EffectId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// Effect type - describes a side effect to be executed
    ///
    /// # Type Parameters
    ///
    /// - `Action`: The action type that effects can produce (feedback loop)
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects in parallel
        Parallel(Vec<Effect<Action>>),

        /// Run effects sequentially
        Sequential(Vec<Effect<Action>>),

        /// Delayed action (countdown ticks, banking periods)
        Delay {
            /// How long to wait
            duration: Duration,
            /// Action to dispatch after delay
            action: Box<Action>,
        },

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is fed back into the reducer
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),

        /// Run an effect as part of the named cancellable group
        Cancellable {
            /// Group identifier
            id: EffectId,
            /// The effect to run
            effect: Box<Effect<Action>>,
        },

        /// Abort every still-running effect of the named group
        Cancel(EffectId),
    }

    // Manual Debug implementation since Future doesn't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Delay { duration, action } => f
                    .debug_struct("Effect::Delay")
                    .field("duration", duration)
                    .field("action", action)
                    .finish(),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
                Effect::Cancellable { id, effect } => f
                    .debug_struct("Effect::Cancellable")
                    .field("id", id)
                    .field("effect", effect)
                    .finish(),
                Effect::Cancel(id) => f.debug_tuple("Effect::Cancel").field(id).finish(),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run in parallel
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Chain effects to run sequentially
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Dispatch `action` after `duration`
        #[must_use]
        pub fn delay(duration: Duration, action: Action) -> Effect<Action> {
            Effect::Delay {
                duration,
                action: Box::new(action),
            }
        }

        /// Wrap this effect in the cancellable group `id`
        #[must_use]
        pub fn cancellable(self, id: EffectId) -> Effect<Action> {
            Effect::Cancellable {
                id,
                effect: Box::new(self),
            }
        }

        /// All delayed actions reachable from this effect, with their delays
        ///
        /// Futures are opaque and are not inspected.
        #[must_use]
        pub fn delayed_actions(&self) -> Vec<(Duration, &Action)> {
            let mut out = Vec::new();
            self.collect_delays(&mut out);
            out
        }

        fn collect_delays<'a>(&'a self, out: &mut Vec<(Duration, &'a Action)>) {
            match self {
                Effect::Delay { duration, action } => out.push((*duration, &**action)),
                Effect::Parallel(effects) | Effect::Sequential(effects) => {
                    for effect in effects {
                        effect.collect_delays(out);
                    }
                },
                Effect::Cancellable { effect, .. } => effect.collect_delays(out),
                Effect::None | Effect::Future(_) | Effect::Cancel(_) => {},
            }
        }

        /// Whether this effect (or a nested one) cancels group `id`
        #[must_use]
        pub fn cancels(&self, id: &EffectId) -> bool {
            match self {
                Effect::Cancel(cancelled) => cancelled == id,
                Effect::Parallel(effects) | Effect::Sequential(effects) => {
                    effects.iter().any(|e| e.cancels(id))
                },
                Effect::Cancellable { effect, .. } => effect.cancels(id),
                Effect::None | Effect::Delay { .. } | Effect::Future(_) => false,
            }
        }

        /// Whether this effect (or a nested one) starts a member of group `id`
        #[must_use]
        pub fn schedules(&self, id: &EffectId) -> bool {
            match self {
                Effect::Cancellable { id: group, effect } => group == id || effect.schedules(id),
                Effect::Parallel(effects) | Effect::Sequential(effects) => {
                    effects.iter().any(|e| e.schedules(id))
                },
                Effect::None | Effect::Delay { .. } | Effect::Future(_) | Effect::Cancel(_) => {
                    false
                },
            }
        }
    }
}

/// Environment module - Dependency injection traits
///
/// External dependencies are abstracted behind traits and injected through
/// the reducer's Environment parameter.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The race reducer reads the clock once when the countdown elapses to
    /// stamp the race start.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::effect::{Effect, EffectId};
    use super::environment::{Clock, SystemClock};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Tick {
        At(u64),
    }

    #[test]
    fn delayed_actions_walks_nested_groups() {
        let effect = Effect::merge(vec![
            Effect::delay(Duration::from_secs(1), Tick::At(1)),
            Effect::delay(Duration::from_secs(2), Tick::At(2)),
        ])
        .cancellable(EffectId::from_static("countdown"));

        let delays = effect.delayed_actions();
        assert_eq!(delays.len(), 2);
        assert_eq!(delays[1], (Duration::from_secs(2), &Tick::At(2)));
        assert!(effect.schedules(&EffectId::from_static("countdown")));
        assert!(!effect.cancels(&EffectId::from_static("countdown")));
    }

    #[test]
    fn cancel_is_detected_inside_sequences() {
        let id = EffectId::new("completion");
        let effect: Effect<Tick> = Effect::chain(vec![Effect::None, Effect::Cancel(id.clone())]);
        assert!(effect.cancels(&id));
        assert!(!effect.cancels(&EffectId::from_static("countdown")));
    }

    #[test]
    fn future_effects_are_opaque() {
        let effect: Effect<Tick> = Effect::Future(Box::pin(async { Some(Tick::At(3)) }));
        assert!(effect.delayed_actions().is_empty());
        assert_eq!(format!("{effect:?}"), "Effect::Future(<future>)");

        if let Effect::Future(fut) = effect {
            assert_eq!(tokio_test::block_on(fut), Some(Tick::At(3)));
        }
    }

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        assert!(clock.now() >= first);
    }
}
