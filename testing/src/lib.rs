//! # Inflight Testing
//!
//! Testing utilities and helpers for keyed in-flight request coordination.
//!
//! This crate provides:
//! - Deterministic clocks (`FixedClock`, `SteppingClock`)
//! - Instrumented fetchers (`CountingFetcher`, `FailingFetcher`)
//! - A fluent `ReducerTest` harness and effect assertions
//! - Tracing setup for tests
//!
//! ## Example
//!
//! ```ignore
//! use inflight_testing::{CountingFetcher, SteppingClock};
//! use inflight_core::SimulatedFetcher;
//! use inflight_runtime::RequestCoordinator;
//!
//! #[tokio::test]
//! async fn test_single_flight() {
//!     let fetcher = CountingFetcher::new(SimulatedFetcher::new(SteppingClock::default()));
//!     let coordinator = RequestCoordinator::new(fetcher.clone());
//!
//!     let first = coordinator.fetch_with_dedupe("A");
//!     let second = coordinator.fetch_with_dedupe("A");
//!
//!     assert_eq!(first.await, second.await);
//!     assert_eq!(fetcher.calls(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use inflight_core::environment::Clock;


pub use reducer_test::{assertions, ReducerTest};

/// Mock implementations of Environment traits and fetchers
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use inflight_core::{CancelToken, FetchError, FetchFuture, Fetcher, Key};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use inflight_testing::mocks::FixedClock;
    /// use inflight_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(epoch())
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Clock that advances by a fixed step on every read
    ///
    /// Successive reads are strictly increasing, so "later" comparisons are
    /// deterministic regardless of scheduling. Clones share the same sequence.
    ///
    /// ```
    /// use inflight_testing::mocks::SteppingClock;
    /// use inflight_core::environment::Clock;
    ///
    /// let clock = SteppingClock::default();
    /// let first = clock.now();
    /// assert!(clock.now() > first);
    /// ```
    #[derive(Debug, Clone)]
    pub struct SteppingClock {
        start: DateTime<Utc>,
        step: chrono::Duration,
        ticks: Arc<AtomicI64>,
    }

    impl SteppingClock {
        /// Start at `start`, advancing `step` per read
        #[must_use]
        pub fn new(start: DateTime<Utc>, step: chrono::Duration) -> Self {
            Self {
                start,
                step,
                ticks: Arc::new(AtomicI64::new(0)),
            }
        }

        /// Number of reads so far
        #[must_use]
        pub fn reads(&self) -> i64 {
            self.ticks.load(Ordering::SeqCst)
        }
    }

    impl Default for SteppingClock {
        /// Starts at 2025-01-01 00:00:00 UTC, one millisecond per read
        fn default() -> Self {
            Self::new(epoch(), chrono::Duration::milliseconds(1))
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Utc> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
            self.start + self.step * i32::try_from(tick).unwrap_or(i32::MAX)
        }
    }

    /// Fetcher wrapper counting invocations per key
    ///
    /// Clones share the same counters, so a clone can be handed to the code
    /// under test while the original is kept for assertions.
    #[derive(Debug, Clone)]
    pub struct CountingFetcher<F> {
        inner: F,
        calls: Arc<Mutex<HashMap<Key, usize>>>,
    }

    impl<F> CountingFetcher<F> {
        /// Wrap `inner`
        #[must_use]
        pub fn new(inner: F) -> Self {
            Self {
                inner,
                calls: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        /// Total invocations across all keys
        #[must_use]
        pub fn calls(&self) -> usize {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .sum()
        }

        /// Invocations for one key
        #[must_use]
        pub fn calls_for(&self, key: &str) -> usize {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .copied()
                .unwrap_or(0)
        }
    }

    impl<F: Fetcher> Fetcher for CountingFetcher<F> {
        fn fetch(&self, key: Key, delay: Duration, signal: Option<CancelToken>) -> FetchFuture {
            *self
                .calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key.clone())
                .or_insert(0) += 1;
            self.inner.fetch(key, delay, signal)
        }
    }

    /// Fetcher that always fails after the delay
    ///
    /// Honors cancellation like the simulated fetcher, so a cancelled call
    /// still reports [`FetchError::Cancelled`].
    #[derive(Debug, Clone)]
    pub struct FailingFetcher {
        reason: String,
    }

    impl FailingFetcher {
        /// Fail every fetch with `reason`
        #[must_use]
        pub fn new(reason: impl Into<String>) -> Self {
            Self {
                reason: reason.into(),
            }
        }
    }

    impl Fetcher for FailingFetcher {
        fn fetch(&self, key: Key, delay: Duration, signal: Option<CancelToken>) -> FetchFuture {
            let reason = self.reason.clone();
            Box::pin(async move {
                let signal = signal.unwrap_or_default();
                tokio::select! {
                    () = tokio::time::sleep(delay) => {},
                    () = signal.cancelled() => return Err(FetchError::Cancelled { key }),
                }
                Err(FetchError::Failed { key, reason })
            })
        }
    }
}

/// Test helpers and utilities
pub mod helpers {
    use std::time::Duration;

    /// Short fetch delay that keeps real-time tests fast
    pub const TEST_FETCH_DELAY: Duration = Duration::from_millis(40);

    /// Install a test-friendly tracing subscriber
    ///
    /// Respects `RUST_LOG`; safe to call from many tests.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use inflight_core::Key;
    use proptest::prelude::*;

    /// Strategy producing short keys drawn from a small alphabet
    ///
    /// A small alphabet makes collisions (and therefore dedupe) likely.
    pub fn key_strategy() -> impl Strategy<Value = Key> {
        "[A-C]{1,2}".prop_map(Key::from)
    }
}

// Re-export commonly used items
pub use helpers::{init_test_tracing, TEST_FETCH_DELAY};
pub use mocks::{test_clock, CountingFetcher, FailingFetcher, FixedClock, SteppingClock};
