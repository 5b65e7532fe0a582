//! # Marketplace Core
//!
//! Functional-core primitives shared by the ticket marketplace crates.
//!
//! Business rules live in reducers: pure functions that validate a command
//! against loaded state, apply the resulting event, and describe (but never
//! perform) the side effects that should follow. The imperative shell in the
//! `marketplace` crate loads state inside a unit of work, runs the reducer,
//! persists the outcome and only then executes the returned effects.
//!
//! ## Core Concepts
//!
//! - **State**: the rows a command needs, loaded for the duration of one unit of work
//! - **Action**: commands (intent) and events (facts) in a single enum
//! - **Reducer**: `(State, Action, Environment) → (State, Effects)`
//! - **Effect**: a description of post-commit work (audit, notification)
//! - **Environment**: injected dependencies (clock, sinks)
//!
//! ## Example
//!
//! ```
//! use marketplace_core::{effect::Effect, reducer::Reducer, SmallVec};
//!
//! #[derive(Default)]
//! struct CounterState {
//!     count: u32,
//! }
//!
//! enum CounterAction {
//!     Increment,
//! }
//!
//! struct CounterReducer;
//!
//! impl Reducer for CounterReducer {
//!     type State = CounterState;
//!     type Action = CounterAction;
//!     type Environment = ();
//!
//!     fn reduce(
//!         &self,
//!         state: &mut CounterState,
//!         action: CounterAction,
//!         _env: &(),
//!     ) -> SmallVec<[Effect<CounterAction>; 4]> {
//!         match action {
//!             CounterAction::Increment => state.count += 1,
//!         }
//!         SmallVec::new()
//!     }
//! }
//!
//! let mut state = CounterState::default();
//! let effects = CounterReducer.reduce(&mut state, CounterAction::Increment, &());
//! assert_eq!(state.count, 1);
//! assert!(effects.is_empty());
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use smallvec::{smallvec, SmallVec};

/// Reducer module - the trait every aggregate implements.
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// A reducer must be deterministic: given the same state, action and
    /// environment (including the clock) it produces the same state change and
    /// the same effect descriptions. All I/O happens outside, in the shell that
    /// called it.
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
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
        /// 1. Validates the action against `state`
        /// 2. Updates state in place (or records the rejection)
        /// 3. Returns effect descriptions to be executed after commit
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - side effect descriptions.
///
/// Effects are values. Reducers return them; the caller decides when (and
/// whether) they run. In this workspace they run only after the unit of work
/// that produced them has committed.
pub mod effect {
    use futures::future::{join_all, BoxFuture};
    use futures::FutureExt;
    use std::future::Future;
    use std::pin::Pin;

    /// Effect type - describes a side effect to be executed
    ///
    /// # Type Parameters
    ///
    /// - `Action`: The action type that effects can produce (feedback loop)
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects concurrently
        Parallel(Vec<Effect<Action>>),

        /// Run effects one after another
        Sequential(Vec<Effect<Action>>),

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is handed back to the caller
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),
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
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action>
    where
        Action: Send + 'static,
    {
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

        /// Wraps a future as an effect
        #[must_use]
        pub fn future<F>(future: F) -> Effect<Action>
        where
            F: Future<Output = Option<Action>> + Send + 'static,
        {
            Effect::Future(Box::pin(future))
        }

        /// Returns `true` for [`Effect::None`]
        #[must_use]
        pub const fn is_none(&self) -> bool {
            matches!(self, Effect::None)
        }

        /// Executes the effect tree, returning every action the futures produced.
        ///
        /// Parallel branches are joined, sequential branches are awaited in order.
        pub fn run(self) -> BoxFuture<'static, Vec<Action>> {
            match self {
                Effect::None => async { Vec::new() }.boxed(),
                Effect::Future(future) => async move { future.await.into_iter().collect() }.boxed(),
                Effect::Parallel(effects) => async move {
                    join_all(effects.into_iter().map(Effect::run))
                        .await
                        .into_iter()
                        .flatten()
                        .collect()
                }
                .boxed(),
                Effect::Sequential(effects) => async move {
                    let mut actions = Vec::new();
                    for effect in effects {
                        actions.extend(effect.run().await);
                    }
                    actions
                }
                .boxed(),
            }
        }
    }
}

/// Environment module - dependency injection traits.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
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
    use super::effect::Effect;

    #[tokio::test]
    async fn test_run_collects_actions_in_order() {
        let effect: Effect<u32> = Effect::chain(vec![
            Effect::future(async { Some(1) }),
            Effect::None,
            Effect::merge(vec![
                Effect::future(async { Some(2) }),
                Effect::future(async { None }),
            ]),
            Effect::future(async { Some(3) }),
        ]);

        assert_eq!(effect.run().await, vec![1, 2, 3]);
    }

    #[test]
    fn test_is_none() {
        assert!(Effect::<()>::None.is_none());
        assert!(!Effect::<()>::merge(vec![]).is_none());
    }
}
