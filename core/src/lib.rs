//! # Inflight Core
//!
//! Runtime-free types shared by the coordinator and the lifecycle tracker:
//! keys, the cancellable fetch primitive, lifecycle events with their
//! bounded log, and the reducer/effect/clock seams the runtime builds on.
//!
//! ## Example
//!
//! ```ignore
//! use inflight_core::fetch::{CancelToken, Fetcher, SimulatedFetcher};
//! use inflight_core::environment::SystemClock;
//! use std::time::Duration;
//!
//! let fetcher = SimulatedFetcher::new(SystemClock);
//! let token = CancelToken::new();
//!
//! let result = fetcher
//!     .fetch("A".into(), Duration::from_millis(800), Some(token.clone()))
//!     .await?;
//! assert_eq!(result.key.as_str(), "A");
//! ```

pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{smallvec, SmallVec};

/// Keys naming logical resources
pub mod key;

/// Fetch primitive and cooperative cancellation
pub mod fetch;

/// Lifecycle events and the bounded event log
pub mod event;

pub use event::{EventLog, Phase, RequestEvent, RequestId, DEFAULT_EVENT_CAPACITY};
pub use fetch::{
    CancelToken, FetchError, FetchFuture, FetchResult, Fetcher, SimulatedFetcher,
    DEFAULT_FETCH_DELAY,
};
pub use key::Key;

/// Reducers: state transitions that describe, but never run, their effects
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// Applies an action to state and returns the work it implies
    ///
    /// `reduce` runs under the store's write lock, so it must not block.
    /// Anything asynchronous goes into an [`Effect::Future`] that the store
    /// spawns after the lock is released.
    ///
    /// ```ignore
    /// impl Reducer for LifecycleReducer<SystemClock> {
    ///     type State = RequestsState;
    ///     type Action = RequestAction;
    ///     type Environment = LifecycleEnvironment<SystemClock>;
    ///
    ///     fn reduce(
    ///         &self,
    ///         state: &mut RequestsState,
    ///         action: RequestAction,
    ///         env: &Self::Environment,
    ///     ) -> SmallVec<[Effect<RequestAction>; 4]> {
    ///         match action {
    ///             RequestAction::ClearEvents => {
    ///                 state.events.clear();
    ///                 smallvec![Effect::None]
    ///             }
    ///             _ => smallvec![Effect::None],
    ///         }
    ///     }
    /// }
    /// ```
    pub trait Reducer {
        /// State owned by the store
        type State;

        /// Inputs, including those fed back by effects
        type Action;

        /// Injected dependencies
        type Environment;

        /// Update `state` for `action` and return the effects to spawn
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effects returned by reducers
pub mod effect {
    use std::future::Future;
    use std::pin::Pin;

    /// Work for the store to run after a reduction
    pub enum Effect<Action> {
        /// Nothing to run
        None,

        /// Await the future on its own task; a `Some` output is reduced next
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),
    }

    impl<Action> std::fmt::Debug for Effect<Action> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => f.write_str("Effect::None"),
                Effect::Future(_) => f.write_str("Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Box `fut` as an [`Effect::Future`]
        pub fn future<F>(fut: F) -> Effect<Action>
        where
            F: Future<Output = Option<Action>> + Send + 'static,
        {
            Effect::Future(Box::pin(fut))
        }
    }
}

/// Injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Source of timestamps for events and fetch results
    ///
    /// Tests substitute fixed or stepping clocks so timestamps are
    /// deterministic.
    pub trait Clock: Send + Sync {
        /// Current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
