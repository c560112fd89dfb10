//! # Inflight Runtime
//!
//! Async side of keyed in-flight request coordination.
//!
//! - [`RequestCoordinator`] owns the per-key registry and applies the
//!   dedupe or cancel-previous policy to every fetch.
//! - [`Store`] reduces actions under a write lock and drives the futures the
//!   reducer hands back.
//! - [`LifecycleTracker`] runs the lifecycle reducer on a [`Store`] and keeps
//!   the bounded pending / fulfilled / rejected event log.
//!
//! ## Example
//!
//! ```ignore
//! use inflight_runtime::{LifecycleTracker, RequestMode, TrackerConfig};
//! use inflight_core::environment::SystemClock;
//!
//! let tracker = LifecycleTracker::new(SystemClock, TrackerConfig::default());
//!
//! let mut request = tracker.request("A", RequestMode::Dedupe).await?;
//! assert_eq!(tracker.events().await[0].source, "dedupe-pending");
//!
//! request.wait().await;
//! assert_eq!(tracker.events().await[0].source, "dedupe-fulfilled");
//! ```

use inflight_core::{effect::Effect, reducer::Reducer};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

/// Keyed single-flight coordination
pub mod coordinator;

/// Request lifecycle tracking on top of the Store
pub mod lifecycle;

/// Prometheus metrics for observability
pub mod metrics;

pub use coordinator::{
    CoordinatorConfig, EntryId, FetchPolicy, ParsePolicyError, Registry, RequestCoordinator,
    SharedFetch,
};
pub use lifecycle::{
    LifecycleEnvironment, LifecycleReducer, LifecycleTracker, PendingRequest, RequestAction,
    RequestMode, RequestOutcome, RequestsState, TrackedRequest, TrackerConfig,
};

/// Error types for the Store runtime
pub mod error {
    use thiserror::Error;

    /// Failures of store and tracker operations
    #[derive(Error, Debug)]
    pub enum StoreError {
        /// `shutdown` has been called; new actions are refused
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// Effects were still running when the shutdown deadline passed
        #[error("Shutdown timed out with {0} effects still running")]
        ShutdownTimeout(usize),

        /// A request did not settle within the caller's deadline
        #[error("Timed out waiting for request to settle")]
        Timeout,

        /// The reply for a request was dropped before it settled
        #[error("Reply channel closed before the request settled")]
        ChannelClosed,
    }
}

pub use error::StoreError;

/// Store tuning
///
/// ```ignore
/// let config = StoreConfig::default().with_broadcast_capacity(256);
/// let store = Store::with_config(state, reducer, env, config);
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Fed-back actions buffered per subscriber before it starts lagging
    pub broadcast_capacity: usize,
}

impl StoreConfig {
    /// Set the action broadcast capacity
    #[must_use]
    pub const fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 16,
        }
    }
}

/// Completion handle for the effects of one sent action
///
/// The count covers each effect until the action it feeds back has been
/// reduced, so after [`wait`](Self::wait) returns the state reflects it.
#[derive(Clone)]
pub struct EffectHandle {
    effects: Arc<AtomicUsize>,
    completion: watch::Receiver<()>,
}

impl EffectHandle {
    fn new() -> (Self, EffectTracking) {
        let counter = Arc::new(AtomicUsize::new(0));
        let (notifier, completion) = watch::channel(());

        (
            Self {
                effects: Arc::clone(&counter),
                completion,
            },
            EffectTracking { counter, notifier },
        )
    }

    /// Wait until every effect of the action has finished
    pub async fn wait(&mut self) {
        while self.effects.load(Ordering::SeqCst) > 0 {
            if self.completion.changed().await.is_err() {
                // Every tracker dropped, so nothing can still be running
                break;
            }
        }
    }
}

impl std::fmt::Debug for EffectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectHandle")
            .field("pending_effects", &self.effects.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Writer side of an [`EffectHandle`]
#[derive(Clone)]
struct EffectTracking {
    counter: Arc<AtomicUsize>,
    notifier: watch::Sender<()>,
}

impl EffectTracking {
    fn increment(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        if self.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.notifier.send(());
        }
    }
}

/// Releases one effect from its handle when dropped, panics included
struct DecrementGuard(EffectTracking);

impl Drop for DecrementGuard {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

/// Releases one effect from the store-wide shutdown count when dropped
struct AtomicCounterGuard(Arc<AtomicUsize>);

impl Drop for AtomicCounterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Reducer host: state, environment and effect execution.
pub mod store {
    use super::{
        Arc, AtomicBool, AtomicCounterGuard, AtomicUsize, DecrementGuard, Duration, Effect,
        EffectHandle, EffectTracking, Ordering, Reducer, RwLock, StoreConfig, StoreError,
    };
    use tokio::sync::broadcast;

    /// Runs a reducer over shared state
    ///
    /// `send` reduces under the write lock and spawns the returned futures.
    /// Actions those futures produce are reduced in turn and then broadcast
    /// to subscribers. Clones share state, environment and shutdown flag.
    pub struct Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E>,
    {
        state: Arc<RwLock<S>>,
        reducer: R,
        environment: E,
        shutdown: Arc<AtomicBool>,
        pending_effects: Arc<AtomicUsize>,
        action_broadcast: broadcast::Sender<A>,
    }

    impl<S, A, E, R> Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
        A: Send + Clone + 'static,
        S: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        /// Create a store with [`StoreConfig::default`]
        #[must_use]
        pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
            Self::with_config(initial_state, reducer, environment, StoreConfig::default())
        }

        /// Create a store with custom configuration
        #[must_use]
        pub fn with_config(
            initial_state: S,
            reducer: R,
            environment: E,
            config: StoreConfig,
        ) -> Self {
            let (action_broadcast, _) = broadcast::channel(config.broadcast_capacity.max(1));

            Self {
                state: Arc::new(RwLock::new(initial_state)),
                reducer,
                environment,
                shutdown: Arc::new(AtomicBool::new(false)),
                pending_effects: Arc::new(AtomicUsize::new(0)),
                action_broadcast,
            }
        }

        /// The injected environment
        #[must_use]
        pub const fn environment(&self) -> &E {
            &self.environment
        }

        /// Effects still running across every sent action
        #[must_use]
        pub fn pending_effects(&self) -> usize {
            self.pending_effects.load(Ordering::Acquire)
        }

        /// Refuse new actions, then wait for running effects to drain
        ///
        /// Actions fed back by effects that are already running are still
        /// reduced while draining.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownTimeout`] if effects are still running
        /// when `timeout` expires.
        pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
            tracing::info!("Store shutting down");
            self.shutdown.store(true, Ordering::Release);

            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let pending = self.pending_effects.load(Ordering::Acquire);
                if pending == 0 {
                    tracing::info!("Store drained");
                    return Ok(());
                }

                if tokio::time::Instant::now() >= deadline {
                    tracing::error!(pending_effects = pending, "Shutdown deadline passed");
                    return Err(StoreError::ShutdownTimeout(pending));
                }

                tracing::debug!(pending_effects = pending, "Draining effects");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        /// Reduce `action` and start its effects
        ///
        /// State changes are visible once this returns; effects may still be
        /// running.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
        #[tracing::instrument(skip(self, action), name = "store_send")]
        pub async fn send(&self, action: A) -> Result<EffectHandle, StoreError>
        where
            R: Clone,
            E: Clone,
        {
            if self.shutdown.load(Ordering::Acquire) {
                tracing::warn!("Rejected action: store is shutting down");
                return Err(StoreError::ShutdownInProgress);
            }

            Ok(self.send_internal(action).await)
        }

        /// Reduce without the shutdown gate; fed-back actions come through here
        async fn send_internal(&self, action: A) -> EffectHandle
        where
            R: Clone,
            E: Clone,
        {
            let (handle, tracking) = EffectHandle::new();

            let effects = {
                let mut state = self.state.write().await;
                let _span = tracing::debug_span!("reduce").entered();

                let started = std::time::Instant::now();
                let effects = self.reducer.reduce(&mut state, action, &self.environment);
                metrics::histogram!("store_reducer_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                effects
            };

            for effect in effects {
                self.execute_effect(effect, &tracking);
            }

            handle
        }

        /// Observe every action fed back by an effect, after it was reduced
        ///
        /// Slow subscribers lag and skip actions once the buffer set by
        /// [`StoreConfig::broadcast_capacity`] fills.
        #[must_use]
        pub fn subscribe_actions(&self) -> broadcast::Receiver<A> {
            self.action_broadcast.subscribe()
        }

        /// Read the state through a closure
        pub async fn state<F, T>(&self, f: F) -> T
        where
            F: FnOnce(&S) -> T,
        {
            let state = self.state.read().await;
            f(&*state)
        }

        /// Spawn `effect`, counting it against `tracking` and shutdown
        ///
        /// A panicking effect only takes down its own task; the guards still
        /// release its count.
        fn execute_effect(&self, effect: Effect<A>, tracking: &EffectTracking)
        where
            R: Clone,
            E: Clone,
        {
            let Effect::Future(fut) = effect else {
                metrics::counter!("store_effects_executed_total", "type" => "none").increment(1);
                return;
            };

            metrics::counter!("store_effects_executed_total", "type" => "future").increment(1);
            tracking.increment();
            self.pending_effects.fetch_add(1, Ordering::SeqCst);
            // Shutdown count drops first, so a woken handle sees it released
            let guards = (
                AtomicCounterGuard(Arc::clone(&self.pending_effects)),
                DecrementGuard(tracking.clone()),
            );
            let store = self.clone();

            tokio::spawn(async move {
                let _guards = guards;

                if let Some(action) = fut.await {
                    store.send_internal(action.clone()).await;
                    // No subscribers is fine
                    let _ = store.action_broadcast.send(action);
                }
            });
        }
    }

    impl<S, A, E, R> Clone for Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Clone,
        E: Clone,
    {
        fn clone(&self) -> Self {
            Self {
                state: Arc::clone(&self.state),
                reducer: self.reducer.clone(),
                environment: self.environment.clone(),
                shutdown: Arc::clone(&self.shutdown),
                pending_effects: Arc::clone(&self.pending_effects),
                action_broadcast: self.action_broadcast.clone(),
            }
        }
    }
}

pub use store::Store;
