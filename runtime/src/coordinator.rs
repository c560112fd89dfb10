//! Keyed single-flight request coordination.
//!
//! The [`RequestCoordinator`] keeps at most one in-flight fetch per key in a
//! [`Registry`]. Callers asking for a key that is already in flight either
//! share the running fetch ([`FetchPolicy::Dedupe`]) or cancel it and start a
//! fresh one ([`FetchPolicy::CancelPrevious`]).
//!
//! # Entry lifecycle
//!
//! ```text
//!   fetch_with_policy(k)           work completes
//!  ──────────────────────► [entry E] ─────────────────► remove k only if
//!          │                  │                         current entry is E
//!          │ CancelPrevious   │ trigger cancel
//!          └─────────────────►└──► removed, replaced by E'
//! ```
//!
//! Every entry carries an [`EntryId`]. Cleanup compares ids rather than keys,
//! so a displaced or reset entry finishing late never removes its successor.
//!
//! # Example
//!
//! ```ignore
//! let coordinator = RequestCoordinator::new(SimulatedFetcher::new(SystemClock));
//!
//! let first = coordinator.fetch_with_dedupe("A");
//! let second = coordinator.fetch_with_dedupe("A");
//! assert_eq!(first.await?, second.await?);
//!
//! let stale = coordinator.fetch_with_policy("A", FetchPolicy::Dedupe);
//! let fresh = coordinator.fetch_with_policy("A", FetchPolicy::CancelPrevious);
//! assert!(stale.await.unwrap_err().is_cancelled());
//! ```

use crate::metrics::CoordinatorMetrics;
use futures::future::{FutureExt, Shared};
use inflight_core::{
    CancelToken, FetchError, FetchFuture, FetchResult, Fetcher, Key, DEFAULT_FETCH_DELAY,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Cloneable handle to the outcome of an in-flight fetch
///
/// All clones settle together with the same output.
pub type SharedFetch = Shared<FetchFuture>;

/// Conflict policy applied when a key is already in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchPolicy {
    /// Reuse the in-flight result
    #[default]
    Dedupe,
    /// Cancel the in-flight fetch and start a new one
    CancelPrevious,
}

impl FetchPolicy {
    /// Wire name (`dedupe` or `cancelPrevious`)
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dedupe => "dedupe",
            Self::CancelPrevious => "cancelPrevious",
        }
    }
}

impl fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown policy name
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown fetch policy: {0}")]
pub struct ParsePolicyError(String);

impl FromStr for FetchPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dedupe" => Ok(Self::Dedupe),
            "cancelPrevious" => Ok(Self::CancelPrevious),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

/// Identity of one in-flight entry
///
/// Ids are unique within a [`Registry`] and strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Bookkeeping for one outstanding fetch
struct InFlightEntry {
    id: EntryId,
    result: SharedFetch,
    cancel: Option<CancelToken>,
}

struct RegistryInner {
    entries: Mutex<HashMap<Key, InFlightEntry>>,
    next_id: AtomicU64,
}

/// Mapping from key to in-flight entry
///
/// At most one entry exists per key. Clones share the same map, so a registry
/// can be constructed up front and injected into one or more coordinators.
/// The map is opaque: reads and writes both go through [`RequestCoordinator`].
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub(crate) fn entry_id(&self, key: &str) -> Option<EntryId> {
        self.lock().get(key).map(|entry| entry.id)
    }

    /// Keys currently in flight, sorted
    pub(crate) fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, InFlightEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> EntryId {
        EntryId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Remove `key` only if its current entry is `id`
    fn remove_if_current(&self, key: &Key, id: EntryId) -> bool {
        let mut entries = self.lock();
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            entries.remove(key);
            CoordinatorMetrics::set_in_flight(entries.len());
            true
        } else {
            false
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("keys", &self.keys())
            .finish_non_exhaustive()
    }
}

/// Configuration for [`RequestCoordinator`]
///
/// # Example
///
/// ```ignore
/// let config = CoordinatorConfig::default()
///     .with_fetch_delay(Duration::from_millis(50));
/// ```
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Delay passed to the fetch primitive
    pub fetch_delay: Duration,
}

impl CoordinatorConfig {
    /// Set the fetch delay
    #[must_use]
    pub const fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fetch_delay: DEFAULT_FETCH_DELAY,
        }
    }
}

/// Single-flight coordinator over a [`Fetcher`]
///
/// Cheap to clone; clones share the fetcher and the registry.
///
/// Every fetch operation must be called from within a Tokio runtime: the work
/// is started eagerly on a spawned task so it progresses (and cleans up after
/// itself) even if no caller polls the returned future.
#[derive(Clone)]
pub struct RequestCoordinator {
    fetcher: Arc<dyn Fetcher>,
    registry: Registry,
    config: CoordinatorConfig,
}

impl RequestCoordinator {
    /// Create a coordinator with its own registry and default configuration
    #[must_use]
    pub fn new(fetcher: impl Fetcher + 'static) -> Self {
        Self::with_registry(fetcher, Registry::new(), CoordinatorConfig::default())
    }

    /// Create a coordinator with its own registry and custom configuration
    #[must_use]
    pub fn with_config(fetcher: impl Fetcher + 'static, config: CoordinatorConfig) -> Self {
        Self::with_registry(fetcher, Registry::new(), config)
    }

    /// Create a coordinator over an injected registry
    #[must_use]
    pub fn with_registry(
        fetcher: impl Fetcher + 'static,
        registry: Registry,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            registry,
            config,
        }
    }

    /// Fetch `key`, sharing any fetch already in flight for it
    ///
    /// For N calls made before the first completes, the fetcher runs exactly
    /// once and all N futures settle with the same output.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn fetch_with_dedupe(&self, key: impl Into<Key>) -> SharedFetch {
        self.fetch_with_policy(key, FetchPolicy::Dedupe)
    }

    /// Fetch `key`, resolving conflicts with `policy`
    ///
    /// With [`FetchPolicy::CancelPrevious`] the existing entry is cancelled and
    /// removed before the new one is registered; its callers settle with
    /// [`FetchError::Cancelled`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn fetch_with_policy(&self, key: impl Into<Key>, policy: FetchPolicy) -> SharedFetch {
        let key = key.into();

        let (result, reserved) = {
            let mut entries = self.registry.lock();

            if policy == FetchPolicy::Dedupe {
                if let Some(existing) = entries.get(&key) {
                    tracing::debug!(%key, entry = %existing.id, "Reusing in-flight fetch");
                    CoordinatorMetrics::record_dedupe_hit();
                    return existing.result.clone();
                }
            }

            if let Some(previous) = entries.remove(&key) {
                tracing::debug!(%key, entry = %previous.id, "Cancelling previous in-flight fetch");
                if let Some(cancel) = &previous.cancel {
                    cancel.trigger();
                }
                CoordinatorMetrics::record_displaced();
            }

            self.reserve(&mut entries, key, policy)
        };

        // Fetcher runs unlocked; it may read the coordinator
        self.start(reserved);
        result
    }

    /// Cancel the in-flight fetch for `key`
    ///
    /// Returns whether an entry existed. Its callers settle with
    /// [`FetchError::Cancelled`].
    pub fn cancel(&self, key: &str) -> bool {
        let mut entries = self.registry.lock();
        let Some(entry) = entries.remove(key) else {
            return false;
        };

        tracing::debug!(%key, entry = %entry.id, "Cancelled in-flight fetch");
        if let Some(cancel) = &entry.cancel {
            cancel.trigger();
        }
        CoordinatorMetrics::set_in_flight(entries.len());
        true
    }

    /// Forget every in-flight entry without cancelling the work
    ///
    /// Outstanding futures still settle normally; their cleanup finds a
    /// different (or no) entry and leaves the registry untouched.
    pub fn reset(&self) {
        let mut entries = self.registry.lock();
        let cleared = entries.len();
        entries.clear();
        CoordinatorMetrics::set_in_flight(0);
        tracing::debug!(cleared, "Registry reset");
    }

    /// Whether `key` is currently in flight
    #[must_use]
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.registry.contains(key)
    }

    /// Number of keys currently in flight
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.registry.len()
    }

    /// Identity of the entry currently registered for `key`
    #[must_use]
    pub fn entry_id(&self, key: &str) -> Option<EntryId> {
        self.registry.entry_id(key)
    }

    /// Keys currently in flight, sorted
    #[must_use]
    pub fn in_flight_keys(&self) -> Vec<Key> {
        self.registry.keys()
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Register an entry for `key` whose result is delivered by [`Self::start`]
    ///
    /// Must be called with the registry lock held so lookup and insert form
    /// one step.
    fn reserve(
        &self,
        entries: &mut HashMap<Key, InFlightEntry>,
        key: Key,
        policy: FetchPolicy,
    ) -> (SharedFetch, Reserved) {
        let id = self.registry.next_id();
        let cancel = CancelToken::new();
        let (done, settled) = oneshot::channel();

        let result = settled
            .map(|received| {
                received.unwrap_or_else(|_| {
                    Err(FetchError::Aborted("fetch task dropped before settling".to_string()))
                })
            })
            .boxed()
            .shared();

        tracing::debug!(%key, entry = %id, %policy, "Registering fetch");
        entries.insert(
            key.clone(),
            InFlightEntry {
                id,
                result: result.clone(),
                cancel: Some(cancel.clone()),
            },
        );
        CoordinatorMetrics::record_fetch_started(policy);
        CoordinatorMetrics::set_in_flight(entries.len());

        (
            result,
            Reserved {
                key,
                id,
                cancel,
                done,
            },
        )
    }

    /// Run the fetch for a reserved entry on its own task
    fn start(&self, reserved: Reserved) {
        let Reserved {
            key,
            id,
            cancel,
            done,
        } = reserved;

        let work = self
            .fetcher
            .fetch(key.clone(), self.config.fetch_delay, Some(cancel.clone()));
        let registry = self.registry.clone();
        let started = std::time::Instant::now();

        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(work).catch_unwind().await.unwrap_or_else(|_| {
                Err(FetchError::Aborted(format!("fetch for '{key}' panicked")))
            });

            // Displacement triggers the token under the registry lock, so once
            // removal has taken the lock the token state is final.
            let removed = registry.remove_if_current(&key, id);
            let outcome = match outcome {
                Ok(_) if cancel.is_cancelled() => Err(FetchError::Cancelled { key: key.clone() }),
                outcome => outcome,
            };

            CoordinatorMetrics::record_completed(&outcome, started.elapsed());
            if removed {
                tracing::trace!(%key, entry = %id, "Removed completed entry");
            } else {
                tracing::trace!(%key, entry = %id, "Entry already replaced, skipping removal");
                CoordinatorMetrics::record_stale_cleanup_skipped();
            }

            if done.send(outcome).is_err() {
                tracing::trace!(%key, entry = %id, "No caller awaiting settled fetch");
            }
        });
    }
}

/// An entry registered under the lock whose work has not started yet
struct Reserved {
    key: Key,
    id: EntryId,
    cancel: CancelToken,
    done: oneshot::Sender<Result<FetchResult, FetchError>>,
}

impl fmt::Debug for RequestCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCoordinator")
            .field("in_flight", &self.registry.keys())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use inflight_core::SimulatedFetcher;
    use inflight_testing::{CountingFetcher, FailingFetcher, SteppingClock, TEST_FETCH_DELAY};

    fn coordinator() -> (RequestCoordinator, CountingFetcher<SimulatedFetcher<SteppingClock>>) {
        let fetcher = CountingFetcher::new(SimulatedFetcher::new(SteppingClock::default()));
        let config = CoordinatorConfig::default().with_fetch_delay(TEST_FETCH_DELAY);
        (RequestCoordinator::with_config(fetcher.clone(), config), fetcher)
    }

    #[tokio::test]
    async fn test_single_flight_for_concurrent_callers() {
        let (coordinator, fetcher) = coordinator();

        let futures: Vec<_> = (0..5).map(|_| coordinator.fetch_with_dedupe("A")).collect();
        assert_eq!(coordinator.in_flight_count(), 1);

        let results = futures::future::join_all(futures).await;
        let first = results[0].clone().unwrap();
        for result in results {
            assert_eq!(result.unwrap(), first);
        }
        assert_eq!(fetcher.calls_for("A"), 1);
    }

    #[tokio::test]
    async fn test_registry_empty_after_completion() {
        let (coordinator, _) = coordinator();

        let result = coordinator.fetch_with_dedupe("A").await.unwrap();

        assert_eq!(result.key, Key::from("A"));
        assert!(!coordinator.is_in_flight("A"));
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_fetch_independently() {
        let (coordinator, fetcher) = coordinator();

        let a = coordinator.fetch_with_dedupe("A");
        let b = coordinator.fetch_with_dedupe("B");
        assert_eq!(coordinator.in_flight_keys(), vec![Key::from("A"), Key::from("B")]);

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap().key, Key::from("A"));
        assert_eq!(b.unwrap().key, Key::from("B"));
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_sequential_requests_fetch_again() {
        let (coordinator, fetcher) = coordinator();

        let first = coordinator.fetch_with_dedupe("A").await.unwrap();
        let second = coordinator.fetch_with_dedupe("A").await.unwrap();

        assert!(second.timestamp > first.timestamp);
        assert_eq!(fetcher.calls_for("A"), 2);
    }

    #[tokio::test]
    async fn test_cancel_previous_rejects_displaced_caller() {
        let (coordinator, fetcher) = coordinator();

        let first = coordinator.fetch_with_policy("A", FetchPolicy::Dedupe);
        let first_id = coordinator.entry_id("A").unwrap();
        let second = coordinator.fetch_with_policy("A", FetchPolicy::CancelPrevious);
        let second_id = coordinator.entry_id("A").unwrap();
        assert!(second_id > first_id);

        let error = first.await.unwrap_err();
        assert_eq!(error, FetchError::Cancelled { key: "A".into() });

        // Displaced entry's cleanup must not remove its successor
        assert_eq!(coordinator.entry_id("A"), Some(second_id));

        let result = second.await.unwrap();
        assert_eq!(result.key, Key::from("A"));
        assert!(!coordinator.is_in_flight("A"));
        assert_eq!(fetcher.calls_for("A"), 2);
    }

    #[tokio::test]
    async fn test_cancel_previous_without_entry_behaves_like_dedupe() {
        let (coordinator, fetcher) = coordinator();

        let result = coordinator
            .fetch_with_policy("A", FetchPolicy::CancelPrevious)
            .await
            .unwrap();

        assert_eq!(result.key, Key::from("A"));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_fans_out_to_all_callers() {
        let fetcher = CountingFetcher::new(FailingFetcher::new("connection reset"));
        let config = CoordinatorConfig::default().with_fetch_delay(TEST_FETCH_DELAY);
        let coordinator = RequestCoordinator::with_config(fetcher.clone(), config);

        let first = coordinator.fetch_with_dedupe("A");
        let second = coordinator.fetch_with_dedupe("A");
        let (first, second) = tokio::join!(first, second);

        let expected = FetchError::Failed {
            key: "A".into(),
            reason: "connection reset".to_string(),
        };
        assert_eq!(first.unwrap_err(), expected);
        assert_eq!(second.unwrap_err(), expected);
        assert_eq!(fetcher.calls(), 1);
        assert!(!coordinator.is_in_flight("A"));
    }

    #[tokio::test]
    async fn test_explicit_cancel() {
        let (coordinator, _) = coordinator();

        let pending = coordinator.fetch_with_dedupe("A");
        assert!(coordinator.cancel("A"));
        assert!(!coordinator.cancel("A"));

        assert!(pending.await.unwrap_err().is_cancelled());
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_does_not_cancel_or_resurrect() {
        let (coordinator, fetcher) = coordinator();

        let before_reset = coordinator.fetch_with_dedupe("A");
        coordinator.reset();
        coordinator.reset();
        assert_eq!(coordinator.in_flight_count(), 0);

        // Stagger so the earlier fetch settles well before the later one
        tokio::time::sleep(TEST_FETCH_DELAY / 2).await;

        // A new request after reset starts new work
        let after_reset = coordinator.fetch_with_dedupe("A");
        let after_id = coordinator.entry_id("A").unwrap();
        assert_eq!(fetcher.calls_for("A"), 2);

        assert!(before_reset.await.is_ok());
        assert_eq!(coordinator.entry_id("A"), Some(after_id));

        assert!(after_reset.await.is_ok());
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_registry_is_shared() {
        let registry = Registry::new();
        let fetcher = SimulatedFetcher::new(SteppingClock::default());
        let config = CoordinatorConfig::default().with_fetch_delay(TEST_FETCH_DELAY);
        let coordinator = RequestCoordinator::with_registry(fetcher, registry.clone(), config);

        let pending = coordinator.fetch_with_dedupe("A");
        assert!(registry.contains("A"));

        pending.await.unwrap();
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_independent_coordinators_do_not_share_entries() {
        let (left, left_fetcher) = coordinator();
        let (right, right_fetcher) = coordinator();

        let a = left.fetch_with_dedupe("A");
        let b = right.fetch_with_dedupe("A");
        let _ = tokio::join!(a, b);

        assert_eq!(left_fetcher.calls_for("A"), 1);
        assert_eq!(right_fetcher.calls_for("A"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_across_tasks() {
        let (coordinator, fetcher) = coordinator();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.fetch_with_dedupe("A").await })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(fetcher.calls_for("A"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_displacement_after_work_finished_still_cancels() {
        let fetcher = SimulatedFetcher::new(SteppingClock::default());
        let config = CoordinatorConfig::default().with_fetch_delay(Duration::ZERO);
        let coordinator = RequestCoordinator::with_config(fetcher, config);

        let displaced = coordinator.fetch_with_dedupe("A");
        {
            let mut entries = coordinator.registry.lock();
            // The work finishes while its cleanup waits on this lock
            std::thread::sleep(Duration::from_millis(100));

            let previous = entries.remove("A").expect("entry still registered");
            previous.cancel.as_ref().unwrap().trigger();
        }

        assert_eq!(
            displaced.await.unwrap_err(),
            FetchError::Cancelled { key: "A".into() }
        );
    }

    /// Fetcher that inspects the registry synchronously from `fetch`
    struct RegistryReadingFetcher {
        registry: Registry,
        seen: Arc<Mutex<Vec<bool>>>,
        inner: SimulatedFetcher<SteppingClock>,
    }

    impl Fetcher for RegistryReadingFetcher {
        fn fetch(&self, key: Key, delay: Duration, signal: Option<CancelToken>) -> FetchFuture {
            let registered = self.registry.contains(key.as_str());
            self.seen.lock().unwrap().push(registered);
            self.inner.fetch(key, delay, signal)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fetcher_can_read_registry_while_starting() {
        let registry = Registry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fetcher = RegistryReadingFetcher {
            registry: registry.clone(),
            seen: Arc::clone(&seen),
            inner: SimulatedFetcher::new(SteppingClock::default()),
        };
        let config = CoordinatorConfig::default().with_fetch_delay(TEST_FETCH_DELAY);
        let coordinator = RequestCoordinator::with_registry(fetcher, registry, config);

        let starting = tokio::task::spawn_blocking(move || coordinator.fetch_with_dedupe("A"));
        let pending = tokio::time::timeout(Duration::from_secs(2), starting)
            .await
            .expect("fetch start blocked on the registry")
            .unwrap();

        assert_eq!(pending.await.unwrap().key, Key::from("A"));
        // The entry is registered before the fetcher runs
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_panicking_fetch_settles_and_cleans_up() {
        struct PanickingFetcher;

        impl Fetcher for PanickingFetcher {
            fn fetch(&self, _: Key, _: Duration, _: Option<CancelToken>) -> FetchFuture {
                Box::pin(async { panic!("fetch exploded") })
            }
        }

        let coordinator = RequestCoordinator::new(PanickingFetcher);

        let error = coordinator.fetch_with_dedupe("A").await.unwrap_err();

        assert!(matches!(error, FetchError::Aborted(_)));
        assert!(!coordinator.is_in_flight("A"));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("dedupe".parse::<FetchPolicy>(), Ok(FetchPolicy::Dedupe));
        assert_eq!(
            "cancelPrevious".parse::<FetchPolicy>(),
            Ok(FetchPolicy::CancelPrevious)
        );
        assert_eq!(
            "cancel-previous".parse::<FetchPolicy>(),
            Err(ParsePolicyError("cancel-previous".to_string()))
        );
        assert_eq!(FetchPolicy::default(), FetchPolicy::Dedupe);
    }

    #[test]
    fn test_policy_serde_names() {
        let json = serde_json::to_string(&FetchPolicy::CancelPrevious).unwrap();
        assert_eq!(json, "\"cancelPrevious\"");
        let policy: FetchPolicy = serde_json::from_str("\"dedupe\"").unwrap();
        assert_eq!(policy, FetchPolicy::Dedupe);
    }
}
