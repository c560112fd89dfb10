//! # Request Demo
//!
//! Scenarios contrasting ways of avoiding duplicate requests for one key.
//!
//! Each scenario drives a [`LifecycleTracker`] and leaves its trace in the
//! event log:
//! - **bad dedupe**: a global `loading` flag used as a dedupe guard
//! - **direct twice**: two direct requests, two fetches
//! - **dedupe twice**: two tracked requests through the coordinator, one fetch
//! - **manual direct**: two raw coordinator calls sharing one result
//! - **A-B-A**: `A`, then `A-B`, then `A` again under both policies
//!
//! ## Example
//!
//! ```no_run
//! use request_demo::Scenarios;
//! use inflight_core::environment::SystemClock;
//! use inflight_runtime::TrackerConfig;
//!
//! # async fn example() -> Result<(), inflight_runtime::StoreError> {
//! let scenarios = Scenarios::new(SystemClock, TrackerConfig::default());
//! scenarios.dedupe_twice("A").await?;
//! println!("{}", request_demo::render_events(&scenarios.tracker().events().await));
//! # Ok(())
//! # }
//! ```

use inflight_core::environment::Clock;
use inflight_core::{FetchResult, Fetcher, Key, RequestEvent, RequestId, SimulatedFetcher};
use inflight_runtime::{FetchPolicy, LifecycleTracker, RequestMode, StoreError, TrackerConfig};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

/// Replays request scenarios against one tracker
pub struct Scenarios<C>
where
    C: Clock + Clone + 'static,
{
    tracker: LifecycleTracker<C>,
    fetcher: Arc<dyn Fetcher>,
    fetch_delay: Duration,
}

impl<C> Scenarios<C>
where
    C: Clock + Clone + 'static,
{
    /// Create scenarios over a simulated fetcher stamped with `clock`
    #[must_use]
    pub fn new(clock: C, config: TrackerConfig) -> Self {
        let fetcher = SimulatedFetcher::new(clock.clone());
        Self::with_fetcher(clock, fetcher, config)
    }

    /// Create scenarios over a custom fetcher
    #[must_use]
    pub fn with_fetcher(clock: C, fetcher: impl Fetcher + 'static, config: TrackerConfig) -> Self {
        let fetcher: Arc<dyn Fetcher> = Arc::new(fetcher);
        let fetch_delay = config.fetch_delay;
        let tracker = LifecycleTracker::with_fetcher(clock, Arc::clone(&fetcher), config);

        Self {
            tracker,
            fetcher,
            fetch_delay,
        }
    }

    /// The tracker holding the event log
    #[must_use]
    pub const fn tracker(&self) -> &LifecycleTracker<C> {
        &self.tracker
    }

    /// Use the global `loading` flag as a dedupe guard, twice in a row
    ///
    /// The second attempt is blocked even though the guard says nothing
    /// about which key is loading.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the tracker is shutting
    /// down, including when it shuts down before the fetch is recorded.
    pub async fn bad_dedupe(&self, key: &str) -> Result<(), StoreError> {
        let mut running = Vec::new();

        for _ in 0..2 {
            if self.tracker.loading().await {
                tracing::info!(%key, "Blocked by loading flag");
                let event = RequestEvent::new(
                    "bad-block",
                    Key::from(key),
                    chrono::Utc::now(),
                    "bad-dedupe-block",
                );
                self.tracker.push_event(event).await?;
                continue;
            }

            self.tracker.set_loading(true).await?;
            let work = self.fetcher.fetch(Key::from(key), self.fetch_delay, None);
            let tracker = self.tracker.clone();
            running.push(tokio::spawn(async move {
                match work.await {
                    Ok(result) => {
                        let id = format!("bad:{}", RequestId::new());
                        tracker.push_event(settled(id, result, "bad-dedupe-res")).await?;
                    },
                    Err(error) => tracing::info!(%error, "Bad dedupe fetch failed"),
                }
                tracker.set_loading(false).await
            }));
        }

        let mut outcome = Ok(());
        for task in running {
            match task.await {
                Ok(Ok(())) => {},
                Ok(Err(error)) => {
                    tracing::warn!(%error, "Bad dedupe could not record its result");
                    if outcome.is_ok() {
                        outcome = Err(error);
                    }
                },
                Err(error) => tracing::warn!(%error, "Bad dedupe task aborted"),
            }
        }
        outcome
    }

    /// Issue two direct requests for `key` and wait for both
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the tracker is shutting down.
    pub async fn direct_twice(&self, key: &str) -> Result<(), StoreError> {
        self.twice(key, RequestMode::Direct).await
    }

    /// Issue two dedupe requests for `key` and wait for both
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the tracker is shutting down.
    pub async fn dedupe_twice(&self, key: &str) -> Result<(), StoreError> {
        self.twice(key, RequestMode::Dedupe).await
    }

    async fn twice(&self, key: &str, mode: RequestMode) -> Result<(), StoreError> {
        let mut first = self.tracker.request(key, mode).await?;
        let mut second = self.tracker.request(key, mode).await?;
        first.wait().await;
        second.wait().await;
        Ok(())
    }

    /// Call the coordinator twice for `key` without the tracker
    ///
    /// Both calls share one fetch; each records its result manually.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the tracker is shutting down.
    pub async fn manual_direct(&self, key: &str) -> Result<(), StoreError> {
        let coordinator = self.tracker.coordinator();
        let first = coordinator.fetch_with_dedupe(key);
        let second = coordinator.fetch_with_dedupe(key);
        let (first, second) = tokio::join!(first, second);

        for (outcome, source) in [(first, "manual-direct"), (second, "manual-direct-2")] {
            match outcome {
                Ok(result) => {
                    let id = format!("{source}:{}", RequestId::new());
                    self.tracker.push_event(settled(id, result, source)).await?;
                },
                Err(error) => tracing::info!(%error, source, "Manual fetch failed"),
            }
        }
        Ok(())
    }

    /// Request `key`, then `{key}-B`, then `key` again under `policy`
    ///
    /// With [`FetchPolicy::Dedupe`] the second `key` request shares the first
    /// one's result. With [`FetchPolicy::CancelPrevious`] it cancels the first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the tracker is shutting down.
    pub async fn aba(&self, key: &str, policy: FetchPolicy) -> Result<(), StoreError> {
        let coordinator = self.tracker.coordinator();
        let other = format!("{key}-B");
        let tag = match policy {
            FetchPolicy::Dedupe => "A-2-dedupe",
            FetchPolicy::CancelPrevious => "A-2-cancel",
        };

        let a1 = coordinator.fetch_with_policy(key, policy);
        let b = coordinator.fetch_with_policy(other.as_str(), policy);
        let a2 = coordinator.fetch_with_policy(key, policy);
        let (a1, b, a2) = tokio::join!(a1, b, a2);

        for (outcome, source) in [(a1, "A-1"), (b, "B"), (a2, tag)] {
            match outcome {
                Ok(result) => {
                    let id = format!("{source}:{}", RequestId::new());
                    self.tracker.push_event(settled(id, result, source)).await?;
                },
                Err(error) => tracing::info!(%error, source, "A-B-A fetch did not resolve"),
            }
        }
        Ok(())
    }
}

fn settled(id: String, result: FetchResult, source: &str) -> RequestEvent {
    RequestEvent::new(id, result.key, result.timestamp, source)
}

/// Render events one per line, newest first
///
/// ```text
/// 12:00:00.800 [dedupe-fulfilled] A
/// ```
#[must_use]
pub fn render_events(events: &[RequestEvent]) -> String {
    let mut out = String::new();
    for event in events {
        let _ = writeln!(
            out,
            "{} [{}] {}",
            event.timestamp.format("%H:%M:%S%.3f"),
            event.source,
            event.key
        );
    }
    out
}
