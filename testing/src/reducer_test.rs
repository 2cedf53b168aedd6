//! Given/When/Then testing for reducers.

#![allow(clippy::module_name_repetitions)] // ReducerTest is the natural name

use racetrack_core::{effect::Effect, reducer::Reducer};

type StateAssertion<S> = Box<dyn FnOnce(&S)>;

type EffectAssertion<A> = Box<dyn FnOnce(&[Effect<A>])>;

/// Fluent API for testing reducers with Given-When-Then syntax
///
/// `given_actions` replays actions onto the initial state and discards their
/// effects; only the effects of `when_action` reach `then_effects`.
///
/// # Example
///
/// ```ignore
/// ReducerTest::new(RaceReducer::new())
///     .with_env(env)
///     .given_state(SessionState::new(venue))
///     .given_actions([join(1), join(2)])
///     .when_action(RaceAction::SetReady { entrant: e(1), ready: true })
///     .then_state(|s| assert!(s.team_of(e(1)).is_some()))
///     .then_effects(assertions::assert_no_effects)
///     .run();
/// ```
pub struct ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    reducer: R,
    environment: Option<E>,
    initial_state: Option<S>,
    history: Vec<A>,
    action: Option<A>,
    state_assertions: Vec<StateAssertion<S>>,
    effect_assertions: Vec<EffectAssertion<A>>,
}

impl<R, S, A, E> ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    /// Create a new reducer test with the given reducer
    #[must_use]
    pub const fn new(reducer: R) -> Self {
        Self {
            reducer,
            environment: None,
            initial_state: None,
            history: Vec::new(),
            action: None,
            state_assertions: Vec::new(),
            effect_assertions: Vec::new(),
        }
    }

    /// Set the environment for the test
    #[must_use]
    pub fn with_env(mut self, env: E) -> Self {
        self.environment = Some(env);
        self
    }

    /// Set the initial state (Given)
    #[must_use]
    pub fn given_state(mut self, state: S) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Actions applied before the action under test (Given)
    #[must_use]
    pub fn given_actions(mut self, actions: impl IntoIterator<Item = A>) -> Self {
        self.history.extend(actions);
        self
    }

    /// Set the action to test (When)
    #[must_use]
    pub fn when_action(mut self, action: A) -> Self {
        self.action = Some(action);
        self
    }

    /// Add an assertion about the resulting state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&S) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the resulting effects (Then)
    #[must_use]
    pub fn then_effects<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[Effect<A>]) + 'static,
    {
        self.effect_assertions.push(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if initial state, action, or environment is not set,
    /// or if any assertion fails.
    #[allow(clippy::expect_used)] // Test harness
    pub fn run(self) {
        let mut state = self
            .initial_state
            .expect("Initial state must be set with given_state()");
        let action = self.action.expect("Action must be set with when_action()");
        let env = self
            .environment
            .expect("Environment must be set with with_env()");

        for earlier in self.history {
            let _ = self.reducer.reduce(&mut state, earlier, &env);
        }

        let effects = self.reducer.reduce(&mut state, action, &env);

        for assertion in self.state_assertions {
            assertion(&state);
        }

        for assertion in self.effect_assertions {
            assertion(&effects);
        }
    }
}

/// Helper assertions for effects
pub mod assertions {
    use racetrack_core::effect::{Effect, EffectId};
    use std::time::Duration;

    /// Assert that there are no effects
    ///
    /// # Panics
    ///
    /// Panics if any effect other than `Effect::None` is present.
    pub fn assert_no_effects<A: std::fmt::Debug>(effects: &[Effect<A>]) {
        assert!(
            effects.iter().all(|e| matches!(e, Effect::None)),
            "Expected no effects, but found {}: {:?}",
            effects.len(),
            effects
        );
    }

    /// Assert the number of effects
    ///
    /// # Panics
    ///
    /// Panics if the number of effects doesn't match expected.
    pub fn assert_effects_count<A>(effects: &[Effect<A>], expected: usize) {
        assert_eq!(
            effects.len(),
            expected,
            "Expected {} effects, but found {}",
            expected,
            effects.len()
        );
    }

    /// Assert that some effect cancels group `id`
    ///
    /// # Panics
    ///
    /// Panics if no effect cancels the group.
    pub fn assert_cancels<A>(effects: &[Effect<A>], id: &EffectId) {
        assert!(
            effects.iter().any(|e| e.cancels(id)),
            "Expected effects to cancel group {id}"
        );
    }

    /// Assert that some effect starts a member of group `id`
    ///
    /// # Panics
    ///
    /// Panics if no effect schedules into the group.
    pub fn assert_schedules<A>(effects: &[Effect<A>], id: &EffectId) {
        assert!(
            effects.iter().any(|e| e.schedules(id)),
            "Expected effects to schedule group {id}"
        );
    }

    /// All delayed actions across `effects`, sorted by delay
    #[must_use]
    pub fn delayed_actions<A>(effects: &[Effect<A>]) -> Vec<(Duration, &A)> {
        let mut delays: Vec<_> = effects.iter().flat_map(Effect::delayed_actions).collect();
        delays.sort_by_key(|(delay, _)| *delay);
        delays
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use racetrack_core::effect::{Effect, EffectId};
    use racetrack_core::reducer::Reducer;
    use std::time::Duration;

    #[derive(Clone, Debug)]
    struct Laps {
        count: u32,
    }

    #[derive(Clone, Debug, PartialEq)]
    enum LapAction {
        Lap,
        StartTimer,
        StopTimer,
    }

    struct LapReducer;

    struct NoEnv;

    const TIMER: EffectId = EffectId::from_static("timer");

    impl Reducer for LapReducer {
        type State = Laps;
        type Action = LapAction;
        type Environment = NoEnv;

        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            _env: &Self::Environment,
        ) -> smallvec::SmallVec<[Effect<Self::Action>; 4]> {
            match action {
                LapAction::Lap => {
                    state.count += 1;
                    smallvec::smallvec![Effect::None]
                },
                LapAction::StartTimer => smallvec::smallvec![
                    Effect::merge(vec![
                        Effect::delay(Duration::from_secs(2), LapAction::Lap),
                        Effect::delay(Duration::from_secs(1), LapAction::Lap),
                    ])
                    .cancellable(TIMER)
                ],
                LapAction::StopTimer => smallvec::smallvec![Effect::Cancel(TIMER)],
            }
        }
    }

    #[test]
    fn history_is_applied_before_action() {
        ReducerTest::new(LapReducer)
            .with_env(NoEnv)
            .given_state(Laps { count: 0 })
            .given_actions([LapAction::Lap, LapAction::Lap])
            .when_action(LapAction::Lap)
            .then_state(|state| assert_eq!(state.count, 3))
            .then_effects(|effects| assertions::assert_no_effects(effects))
            .run();
    }

    #[test]
    fn timer_assertions() {
        ReducerTest::new(LapReducer)
            .with_env(NoEnv)
            .given_state(Laps { count: 0 })
            .when_action(LapAction::StartTimer)
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                assertions::assert_schedules(effects, &TIMER);
                let delays = assertions::delayed_actions(effects);
                assert_eq!(delays[0].0, Duration::from_secs(1));
                assert_eq!(delays[1].0, Duration::from_secs(2));
            })
            .run();
    }

    #[test]
    fn cancel_assertion() {
        ReducerTest::new(LapReducer)
            .with_env(NoEnv)
            .given_state(Laps { count: 0 })
            .when_action(LapAction::StopTimer)
            .then_effects(|effects| assertions::assert_cancels(effects, &TIMER))
            .run();
    }
}
