//! Request lifecycle tracking.
//!
//! Every logical request moves through `pending` and then exactly one of
//! `fulfilled` or `rejected`. The transitions are recorded in a bounded
//! [`EventLog`] held by a [`Store`].
//!
//! The protocol has two phases:
//!
//! 1. [`RequestAction::Issue`] is reduced under the store's write lock. It
//!    records the pending event, starts the work and returns one
//!    `Effect::Future`.
//! 2. The effect awaits the work and feeds back [`RequestAction::Fulfilled`]
//!    or [`RequestAction::Rejected`].
//!
//! Because phase 1 completes before [`Store::send`] returns, the pending
//! event is always observable before any settlement.
//!
//! # Example
//!
//! ```ignore
//! let tracker = LifecycleTracker::new(SystemClock, TrackerConfig::default());
//!
//! let first = tracker.request("A", RequestMode::Dedupe).await?;
//! let second = tracker.request("A", RequestMode::Dedupe).await?;
//!
//! // Two pending events, one fetch
//! assert_eq!(tracker.events().await.len(), 2);
//! ```

use crate::coordinator::{CoordinatorConfig, FetchPolicy, RequestCoordinator};
use crate::metrics::LifecycleMetrics;
use crate::{EffectHandle, Store, StoreConfig, StoreError};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use inflight_core::effect::Effect;
use inflight_core::environment::Clock;
use inflight_core::reducer::Reducer;
use inflight_core::{
    smallvec, EventLog, FetchError, FetchFuture, FetchResult, Fetcher, Key, Phase, RequestEvent,
    RequestId, SimulatedFetcher, SmallVec, DEFAULT_EVENT_CAPACITY, DEFAULT_FETCH_DELAY,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

/// How phase 2 performs the work for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestMode {
    /// Call the fetcher directly, without any dedupe
    ///
    /// Drives the `loading` flag.
    Direct,
    /// Go through [`RequestCoordinator::fetch_with_dedupe`]
    Dedupe,
    /// Go through [`RequestCoordinator::fetch_with_policy`]
    Policy(FetchPolicy),
}

impl RequestMode {
    /// Prefix of the `source` tag on every event of this mode
    #[must_use]
    pub const fn origin(self) -> &'static str {
        match self {
            Self::Direct => "thunk",
            Self::Dedupe => "dedupe",
            Self::Policy(FetchPolicy::Dedupe) => "policy-dedupe",
            Self::Policy(FetchPolicy::CancelPrevious) => "policy-cancel-previous",
        }
    }

    /// Whether requests in this mode toggle `loading`
    #[must_use]
    pub const fn drives_loading(self) -> bool {
        matches!(self, Self::Direct)
    }
}

impl fmt::Display for RequestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.origin())
    }
}

/// A request that has been issued but not yet settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Key the request was issued for
    pub key: Key,
    /// How the work is performed
    pub mode: RequestMode,
    /// When the pending transition was recorded
    pub issued_at: DateTime<Utc>,
}

/// State of the lifecycle tracker
#[derive(Debug, Clone, Default)]
pub struct RequestsState {
    /// Transitions, newest first
    pub events: EventLog,
    /// True while a [`RequestMode::Direct`] request is outstanding
    pub loading: bool,
    /// Requests still awaiting their terminal transition
    pub outstanding: HashMap<RequestId, PendingRequest>,
}

impl RequestsState {
    /// Empty state retaining at most `capacity` events
    #[must_use]
    pub fn with_event_capacity(capacity: usize) -> Self {
        Self {
            events: EventLog::with_capacity(capacity),
            loading: false,
            outstanding: HashMap::new(),
        }
    }

    fn record(
        &mut self,
        phase: Phase,
        request_id: RequestId,
        mode: RequestMode,
        key: Key,
        timestamp: DateTime<Utc>,
    ) {
        let event = RequestEvent::transition(phase, request_id, mode.origin(), key, timestamp);
        tracing::debug!(id = %event.id, key = %event.key, source = %event.source, "Lifecycle transition");
        LifecycleMetrics::record_transition(phase);
        self.events.push(event);
    }
}

/// Actions of the lifecycle tracker
#[derive(Debug, Clone)]
pub enum RequestAction {
    /// Phase 1: record pending and start the work
    Issue {
        /// Fresh id of the logical request
        request_id: RequestId,
        /// Key to fetch
        key: Key,
        /// How to perform the work
        mode: RequestMode,
    },
    /// Phase 2: the work succeeded
    Fulfilled {
        /// Request being settled
        request_id: RequestId,
        /// Resolved value
        result: FetchResult,
    },
    /// Phase 2: the work failed or was cancelled
    Rejected {
        /// Request being settled
        request_id: RequestId,
        /// Reason
        error: FetchError,
    },
    /// Append an arbitrary event
    PushEvent(RequestEvent),
    /// Drop every event
    ClearEvents,
    /// Overwrite the `loading` flag
    SetLoading(bool),
}

impl RequestAction {
    /// Issue a new logical request with a fresh id
    #[must_use]
    pub fn issue(key: impl Into<Key>, mode: RequestMode) -> Self {
        Self::Issue {
            request_id: RequestId::new(),
            key: key.into(),
            mode,
        }
    }

    /// Id of the request this action concerns, if any
    #[must_use]
    pub const fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Issue { request_id, .. }
            | Self::Fulfilled { request_id, .. }
            | Self::Rejected { request_id, .. } => Some(*request_id),
            Self::PushEvent(_) | Self::ClearEvents | Self::SetLoading(_) => None,
        }
    }

    /// Whether this action settles request `id`
    #[must_use]
    pub fn is_terminal_for(&self, id: RequestId) -> bool {
        match self {
            Self::Fulfilled { request_id, .. } | Self::Rejected { request_id, .. } => {
                *request_id == id
            },
            _ => false,
        }
    }
}

/// Dependencies of the lifecycle reducer
#[derive(Clone)]
pub struct LifecycleEnvironment<C> {
    /// Stamps pending and rejected transitions
    pub clock: C,
    /// Performs dedupe and policy requests
    pub coordinator: RequestCoordinator,
    /// Performs direct requests
    pub fetcher: Arc<dyn Fetcher>,
    /// Delay passed to the fetcher for direct requests
    pub fetch_delay: Duration,
    replies: Replies,
}

impl<C: Clock> LifecycleEnvironment<C> {
    /// Create an environment
    #[must_use]
    pub fn new(
        clock: C,
        coordinator: RequestCoordinator,
        fetcher: Arc<dyn Fetcher>,
        fetch_delay: Duration,
    ) -> Self {
        Self {
            clock,
            coordinator,
            fetcher,
            fetch_delay,
            replies: Replies::default(),
        }
    }
}

/// Callers awaiting the outcome of a specific request
///
/// The reducer hands each terminal outcome to its waiter, if any, so a caller
/// never depends on the lossy action broadcast for its own result.
#[derive(Clone, Default)]
struct Replies {
    waiting: Arc<Mutex<HashMap<RequestId, oneshot::Sender<RequestOutcome>>>>,
}

impl Replies {
    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, oneshot::Sender<RequestOutcome>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, request_id: RequestId) -> oneshot::Receiver<RequestOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(request_id, tx);
        rx
    }

    fn forget(&self, request_id: RequestId) {
        self.lock().remove(&request_id);
    }

    fn deliver(&self, request_id: RequestId, outcome: impl FnOnce() -> RequestOutcome) {
        let Some(waiter) = self.lock().remove(&request_id) else {
            return;
        };
        if waiter.send(outcome()).is_err() {
            tracing::trace!(%request_id, "Waiter gone before outcome was delivered");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

impl<C> fmt::Debug for LifecycleEnvironment<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleEnvironment")
            .field("coordinator", &self.coordinator)
            .field("fetch_delay", &self.fetch_delay)
            .finish_non_exhaustive()
    }
}

/// Reducer recording request lifecycle transitions
///
/// Generic over the Clock type C to work with any clock implementation.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleReducer<C> {
    _phantom: std::marker::PhantomData<C>,
}

impl<C> LifecycleReducer<C> {
    /// Create a new lifecycle reducer
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<C> Default for LifecycleReducer<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> LifecycleReducer<C> {
    /// Start the work and wrap it in the phase 2 effect
    ///
    /// The work starts here rather than inside the effect so requests reach
    /// the coordinator in the order they were issued.
    fn perform(
        request_id: RequestId,
        key: Key,
        mode: RequestMode,
        env: &LifecycleEnvironment<C>,
    ) -> Effect<RequestAction> {
        let work: FetchFuture = match mode {
            RequestMode::Direct => env.fetcher.fetch(key, env.fetch_delay, None),
            RequestMode::Dedupe => env.coordinator.fetch_with_dedupe(key).boxed(),
            RequestMode::Policy(policy) => env.coordinator.fetch_with_policy(key, policy).boxed(),
        };

        Effect::future(async move {
            Some(match work.await {
                Ok(result) => RequestAction::Fulfilled { request_id, result },
                Err(error) => RequestAction::Rejected { request_id, error },
            })
        })
    }
}

impl<C: Clock> Reducer for LifecycleReducer<C> {
    type State = RequestsState;
    type Action = RequestAction;
    type Environment = LifecycleEnvironment<C>;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            RequestAction::Issue {
                request_id,
                key,
                mode,
            } => {
                if state.outstanding.contains_key(&request_id) {
                    tracing::warn!(%request_id, "Ignoring duplicate issue of outstanding request");
                    return smallvec![Effect::None];
                }

                let issued_at = env.clock.now();
                state.record(Phase::Pending, request_id, mode, key.clone(), issued_at);
                state.outstanding.insert(
                    request_id,
                    PendingRequest {
                        key: key.clone(),
                        mode,
                        issued_at,
                    },
                );
                if mode.drives_loading() {
                    state.loading = true;
                }

                smallvec![Self::perform(request_id, key, mode, env)]
            },
            RequestAction::Fulfilled { request_id, result } => {
                let Some(pending) = settle(state, request_id) else {
                    return smallvec![Effect::None];
                };
                env.replies
                    .deliver(request_id, || RequestOutcome::Fulfilled(result.clone()));
                state.record(
                    Phase::Fulfilled,
                    request_id,
                    pending.mode,
                    result.key,
                    result.timestamp,
                );
                smallvec![Effect::None]
            },
            RequestAction::Rejected { request_id, error } => {
                let Some(pending) = settle(state, request_id) else {
                    return smallvec![Effect::None];
                };
                tracing::debug!(%request_id, %error, "Request rejected");
                env.replies.deliver(request_id, || RequestOutcome::Rejected(error));
                state.record(
                    Phase::Rejected,
                    request_id,
                    pending.mode,
                    pending.key,
                    env.clock.now(),
                );
                smallvec![Effect::None]
            },
            RequestAction::PushEvent(event) => {
                state.events.push(event);
                smallvec![Effect::None]
            },
            RequestAction::ClearEvents => {
                state.events.clear();
                smallvec![Effect::None]
            },
            RequestAction::SetLoading(loading) => {
                state.loading = loading;
                smallvec![Effect::None]
            },
        }
    }
}

/// Remove `request_id` from the outstanding set and refresh `loading`
///
/// Returns `None` (after logging) if the request was not outstanding.
fn settle(state: &mut RequestsState, request_id: RequestId) -> Option<PendingRequest> {
    let Some(pending) = state.outstanding.remove(&request_id) else {
        tracing::warn!(%request_id, "Ignoring terminal transition for request that is not pending");
        return None;
    };

    if pending.mode.drives_loading() {
        state.loading = state
            .outstanding
            .values()
            .any(|other| other.mode.drives_loading());
    }
    Some(pending)
}

/// Configuration for [`LifecycleTracker`]
///
/// # Example
///
/// ```ignore
/// let config = TrackerConfig::default()
///     .with_event_capacity(20)
///     .with_fetch_delay(Duration::from_millis(50));
/// ```
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Number of events retained
    pub event_capacity: usize,
    /// Delay passed to the fetcher
    pub fetch_delay: Duration,
    /// Configuration of the underlying store
    pub store: StoreConfig,
}

impl TrackerConfig {
    /// Set the event log capacity
    #[must_use]
    pub const fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the fetch delay
    #[must_use]
    pub const fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Set the store configuration
    #[must_use]
    pub const fn with_store_config(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            fetch_delay: DEFAULT_FETCH_DELAY,
            store: StoreConfig::default(),
        }
    }
}

/// A logical request issued through [`LifecycleTracker::request`]
#[derive(Debug, Clone)]
pub struct TrackedRequest {
    /// Id carried by every event of this request
    pub id: RequestId,
    /// Completes once the terminal transition has been recorded
    pub handle: EffectHandle,
}

impl TrackedRequest {
    /// Wait until the request has settled
    pub async fn wait(&mut self) {
        self.handle.wait().await;
    }
}

/// Terminal outcome of a logical request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The work succeeded
    Fulfilled(FetchResult),
    /// The work failed or was cancelled
    Rejected(FetchError),
}

impl RequestOutcome {
    /// Convert into a `Result`
    ///
    /// # Errors
    ///
    /// Returns the rejection reason for [`RequestOutcome::Rejected`].
    pub fn into_result(self) -> Result<FetchResult, FetchError> {
        match self {
            Self::Fulfilled(result) => Ok(result),
            Self::Rejected(error) => Err(error),
        }
    }
}

type TrackerStore<C> =
    Store<RequestsState, RequestAction, LifecycleEnvironment<C>, LifecycleReducer<C>>;

/// Facade over a [`Store`] running the [`LifecycleReducer`]
///
/// Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct LifecycleTracker<C>
where
    C: Clock + Clone + 'static,
{
    store: TrackerStore<C>,
}

impl<C> LifecycleTracker<C>
where
    C: Clock + Clone + 'static,
{
    /// Create a tracker backed by a [`SimulatedFetcher`] stamped with `clock`
    #[must_use]
    pub fn new(clock: C, config: TrackerConfig) -> Self {
        let fetcher = SimulatedFetcher::new(clock.clone());
        Self::with_fetcher(clock, fetcher, config)
    }

    /// Create a tracker over a custom fetcher
    ///
    /// The fetcher is shared by direct requests and the coordinator.
    #[must_use]
    pub fn with_fetcher(clock: C, fetcher: impl Fetcher + 'static, config: TrackerConfig) -> Self {
        let fetcher: Arc<dyn Fetcher> = Arc::new(fetcher);
        let coordinator = RequestCoordinator::with_config(
            Arc::clone(&fetcher),
            CoordinatorConfig::default().with_fetch_delay(config.fetch_delay),
        );
        Self::with_coordinator(clock, coordinator, fetcher, config)
    }

    /// Create a tracker over an existing coordinator
    ///
    /// `config.fetch_delay` applies to direct requests only.
    #[must_use]
    pub fn with_coordinator(
        clock: C,
        coordinator: RequestCoordinator,
        fetcher: Arc<dyn Fetcher>,
        config: TrackerConfig,
    ) -> Self {
        let env = LifecycleEnvironment::new(clock, coordinator, fetcher, config.fetch_delay);
        let state = RequestsState::with_event_capacity(config.event_capacity);

        Self {
            store: Store::with_config(state, LifecycleReducer::new(), env, config.store),
        }
    }

    /// Issue a logical request
    ///
    /// The pending event is recorded before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the tracker is shutting down.
    pub async fn request(
        &self,
        key: impl Into<Key>,
        mode: RequestMode,
    ) -> Result<TrackedRequest, StoreError> {
        let id = RequestId::new();
        let handle = self
            .store
            .send(RequestAction::Issue {
                request_id: id,
                key: key.into(),
                mode,
            })
            .await?;
        Ok(TrackedRequest { id, handle })
    }

    /// Issue a logical request and wait for its terminal transition
    ///
    /// The outcome is handed over by the reducer when it records the
    /// transition, so it arrives however many other requests settle at the
    /// same time.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Timeout`]: the request did not settle within `timeout`
    /// - [`StoreError::ShutdownInProgress`]: the tracker is shutting down
    /// - [`StoreError::ChannelClosed`]: the reply was dropped unanswered
    pub async fn request_and_wait(
        &self,
        key: impl Into<Key>,
        mode: RequestMode,
        timeout: Duration,
    ) -> Result<RequestOutcome, StoreError> {
        let request_id = RequestId::new();
        let replies = &self.store.environment().replies;
        let reply = replies.register(request_id);

        let issue = RequestAction::Issue {
            request_id,
            key: key.into(),
            mode,
        };
        if let Err(error) = self.store.send(issue).await {
            replies.forget(request_id);
            return Err(error);
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(StoreError::ChannelClosed),
            Err(_) => {
                replies.forget(request_id);
                tracing::debug!(%request_id, "Gave up waiting for request to settle");
                Err(StoreError::Timeout)
            },
        }
    }

    /// Snapshot of the event log, newest first
    pub async fn events(&self) -> Vec<RequestEvent> {
        self.store.state(|s| s.events.to_vec()).await
    }

    /// Current `loading` flag
    pub async fn loading(&self) -> bool {
        self.store.state(|s| s.loading).await
    }

    /// Number of requests still awaiting their terminal transition
    pub async fn outstanding(&self) -> usize {
        self.store.state(|s| s.outstanding.len()).await
    }

    /// Append an arbitrary event
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the tracker is shutting down.
    pub async fn push_event(&self, event: RequestEvent) -> Result<(), StoreError> {
        self.store.send(RequestAction::PushEvent(event)).await.map(drop)
    }

    /// Drop every event
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the tracker is shutting down.
    pub async fn clear_events(&self) -> Result<(), StoreError> {
        self.store.send(RequestAction::ClearEvents).await.map(drop)
    }

    /// Overwrite the `loading` flag
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the tracker is shutting down.
    pub async fn set_loading(&self, loading: bool) -> Result<(), StoreError> {
        self.store.send(RequestAction::SetLoading(loading)).await.map(drop)
    }

    /// Observe terminal transitions as they are recorded
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RequestAction> {
        self.store.subscribe_actions()
    }

    /// The coordinator used for dedupe and policy requests
    #[must_use]
    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.store.environment().coordinator
    }

    /// Stop accepting requests and wait for outstanding work to settle
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownTimeout`] if work is still running when
    /// `timeout` expires.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
        self.store.shutdown(timeout).await
    }
}

impl<C> fmt::Debug for LifecycleTracker<C>
where
    C: Clock + Clone + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleTracker")
            .field("environment", self.store.environment())
            .finish_non_exhaustive()
    }
}
