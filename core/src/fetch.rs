//! Fetch primitive with cooperative cancellation.
//!
//! The [`Fetcher`] trait performs one unit of asynchronous work for a key and
//! resolves to a [`FetchResult`]. Implementations honor an optional
//! [`CancelToken`]: once the token is triggered the fetch fails with
//! [`FetchError::Cancelled`].
//!
//! [`SimulatedFetcher`] stands in for real I/O. It waits for the requested
//! delay and then stamps the key with the current time from its [`Clock`].
//!
//! # Example
//!
//! ```ignore
//! let fetcher = SimulatedFetcher::new(SystemClock);
//! let token = CancelToken::new();
//!
//! let pending = fetcher.fetch("A".into(), DEFAULT_FETCH_DELAY, Some(token.clone()));
//! token.trigger();
//!
//! assert!(pending.await.unwrap_err().is_cancelled());
//! ```

use crate::environment::Clock;
use crate::key::Key;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Delay used by the simulated fetch when none is configured
pub const DEFAULT_FETCH_DELAY: Duration = Duration::from_millis(800);

/// Successful outcome of a fetch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchResult {
    /// Key the fetch was issued for
    pub key: Key,
    /// Time at which the work completed
    pub timestamp: DateTime<Utc>,
}

impl FetchResult {
    /// Create a new result
    #[must_use]
    pub const fn new(key: Key, timestamp: DateTime<Utc>) -> Self {
        Self { key, timestamp }
    }
}

/// Errors produced by a fetch
///
/// `Clone` so one failure can be fanned out to every caller sharing an
/// in-flight entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The fetch was cancelled before it completed
    ///
    /// This is an expected outcome of `cancelPrevious` displacement or an
    /// explicit cancellation, not a defect.
    #[error("Fetch for '{key}' was cancelled")]
    Cancelled {
        /// Key of the cancelled fetch
        key: Key,
    },

    /// The underlying work failed
    #[error("Fetch for '{key}' failed: {reason}")]
    Failed {
        /// Key of the failed fetch
        key: Key,
        /// Description of the failure
        reason: String,
    },

    /// The task driving the fetch was aborted or panicked
    #[error("Fetch task aborted: {0}")]
    Aborted(String),
}

impl FetchError {
    /// Whether this error is a cancellation
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Boxed future returned by [`Fetcher::fetch`]
pub type FetchFuture = BoxFuture<'static, Result<FetchResult, FetchError>>;

/// Cancellation capability for one unit of work
///
/// Clones share the same signal. Triggering is idempotent and may happen
/// any number of times; once triggered the token stays cancelled.
#[derive(Debug, Clone)]
pub struct CancelToken {
    signal: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create a token that has not been triggered
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
        }
    }

    /// Request cancellation
    pub fn trigger(&self) {
        let already = self.signal.send_replace(true);
        if !already {
            tracing::trace!("Cancel token triggered");
        }
    }

    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }

    /// Wait until cancellation is requested
    ///
    /// Resolves immediately if the token was already triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.signal.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of asynchronous work for a key
///
/// Implementations must be independent per invocation: concurrent calls for
/// the same or different keys never share timers or state that would make
/// one call observe another's cancellation.
pub trait Fetcher: Send + Sync {
    /// Fetch `key`, waiting `delay` and honoring `signal`
    ///
    /// The returned future fails with [`FetchError::Cancelled`] if `signal` is
    /// triggered before the work completes.
    fn fetch(&self, key: Key, delay: Duration, signal: Option<CancelToken>) -> FetchFuture;
}

impl<F> Fetcher for Arc<F>
where
    F: Fetcher + ?Sized,
{
    fn fetch(&self, key: Key, delay: Duration, signal: Option<CancelToken>) -> FetchFuture {
        (**self).fetch(key, delay, signal)
    }
}

/// Timer-backed stand-in for real I/O
#[derive(Debug)]
pub struct SimulatedFetcher<C> {
    clock: Arc<C>,
}

impl<C: Clock> SimulatedFetcher<C> {
    /// Create a fetcher stamping results with `clock`
    #[must_use]
    pub fn new(clock: C) -> Self {
        Self {
            clock: Arc::new(clock),
        }
    }
}

impl<C> Clone for SimulatedFetcher<C> {
    fn clone(&self) -> Self {
        Self {
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<C> Fetcher for SimulatedFetcher<C>
where
    C: Clock + 'static,
{
    fn fetch(&self, key: Key, delay: Duration, signal: Option<CancelToken>) -> FetchFuture {
        let clock = Arc::clone(&self.clock);

        Box::pin(async move {
            let started = std::time::Instant::now();

            if let Some(signal) = &signal {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {},
                    () = signal.cancelled() => {
                        tracing::debug!(%key, "Fetch aborted before timer fired");
                        return Err(FetchError::Cancelled { key });
                    },
                }
            } else {
                tokio::time::sleep(delay).await;
            }

            if signal.as_ref().is_some_and(CancelToken::is_cancelled) {
                tracing::debug!(%key, "Fetch cancelled when timer fired");
                return Err(FetchError::Cancelled { key });
            }

            let result = FetchResult::new(key, clock.now());
            tracing::debug!(
                key = %result.key,
                elapsed_ms = started.elapsed().as_millis(),
                "Fetch resolved"
            );
            Ok(result)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::environment::SystemClock;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_fetch_resolves_with_key() {
        let fetcher = SimulatedFetcher::new(SystemClock);
        let before = Utc::now();

        let result = fetcher.fetch("A".into(), SHORT, None).await.unwrap();

        assert_eq!(result.key, Key::from("A"));
        assert!(result.timestamp >= before);
    }

    #[tokio::test]
    async fn test_fetch_cancelled_during_wait() {
        let fetcher = SimulatedFetcher::new(SystemClock);
        let token = CancelToken::new();

        let pending = fetcher.fetch("A".into(), Duration::from_secs(5), Some(token.clone()));
        let started = std::time::Instant::now();
        token.trigger();
        let error = pending.await.unwrap_err();

        assert_eq!(error, FetchError::Cancelled { key: "A".into() });
        // Abort notification wakes the wait instead of the timer
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_fetch_cancelled_before_start() {
        let fetcher = SimulatedFetcher::new(SystemClock);
        let token = CancelToken::new();
        token.trigger();

        let error = fetcher.fetch("A".into(), SHORT, Some(token)).await.unwrap_err();
        assert!(error.is_cancelled());
    }

    #[tokio::test]
    async fn test_untriggered_signal_does_not_cancel() {
        let fetcher = SimulatedFetcher::new(SystemClock);
        let token = CancelToken::new();

        let result = fetcher.fetch("B".into(), SHORT, Some(token.clone())).await;
        assert!(result.is_ok());
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_concurrent_fetches_are_independent() {
        let fetcher = SimulatedFetcher::new(SystemClock);
        let cancelled = CancelToken::new();
        let kept = CancelToken::new();

        let first = fetcher.fetch("A".into(), SHORT, Some(cancelled.clone()));
        let second = fetcher.fetch("A".into(), SHORT, Some(kept));
        cancelled.trigger();

        let (first, second) = tokio::join!(first, second);
        assert!(first.unwrap_err().is_cancelled());
        assert_eq!(second.unwrap().key, Key::from("A"));
    }

    #[test]
    fn test_trigger_is_idempotent() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());

        token.trigger();
        token.trigger();
        clone.trigger();

        assert!(token.is_cancelled());
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_when_already_triggered() {
        let token = CancelToken::new();
        token.trigger();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn test_cancelled_pending_until_triggered() {
        let token = CancelToken::new();
        let mut waiter = tokio_test::task::spawn(token.cancelled());
        tokio_test::assert_pending!(waiter.poll());

        token.trigger();

        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[test]
    fn test_error_display() {
        let error = FetchError::Failed {
            key: "A".into(),
            reason: "connection reset".to_string(),
        };
        assert_eq!(error.to_string(), "Fetch for 'A' failed: connection reset");
        assert!(!error.is_cancelled());
    }
}
