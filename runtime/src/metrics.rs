//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for:
//! - Request coordinator (fetches started, dedupe hits, displacement, cleanup)
//! - Lifecycle transitions
//! - Store reducer and effect execution
//!
//! # Example
//!
//! ```rust,no_run
//! use inflight_runtime::metrics::MetricsRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut recorder = MetricsRecorder::new();
//! recorder.start()?;
//!
//! if let Some(text) = recorder.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use crate::coordinator::FetchPolicy;
use inflight_core::{FetchError, FetchResult, Phase};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder.
///
/// Installs the global recorder and renders the collected metrics in the
/// Prometheus text format. Nothing is served over the network; callers
/// decide where the rendered text goes.
#[derive(Default)]
pub struct MetricsRecorder {
    handle: Option<PrometheusHandle>,
}

impl MetricsRecorder {
    /// Create a recorder that has not been installed yet
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the metrics exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this
    /// succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder wasn't installed by this instance.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Coordinator Metrics
    describe_counter!(
        "coordinator_fetches_started_total",
        "Total number of fetch primitive invocations started by the coordinator"
    );
    describe_counter!(
        "coordinator_dedupe_hits_total",
        "Total number of requests served by an existing in-flight fetch"
    );
    describe_counter!(
        "coordinator_displaced_total",
        "Total number of in-flight fetches cancelled by a newer request or explicit cancel"
    );
    describe_counter!(
        "coordinator_fetches_completed_total",
        "Total number of fetches settled, labelled by outcome"
    );
    describe_counter!(
        "coordinator_stale_cleanup_skipped_total",
        "Total number of completions whose entry had already been replaced or reset"
    );
    describe_gauge!(
        "coordinator_in_flight",
        "Number of keys currently in flight"
    );
    describe_histogram!(
        "coordinator_fetch_duration_seconds",
        "Time from fetch start to settlement"
    );

    // Lifecycle Metrics
    describe_counter!(
        "lifecycle_transitions_total",
        "Total number of lifecycle transitions, labelled by phase"
    );

    // Store Metrics
    describe_histogram!(
        "store_reducer_duration_seconds",
        "Time taken to execute reducers"
    );
    describe_counter!(
        "store_effects_executed_total",
        "Total number of effects executed, labelled by type"
    );
}

/// Coordinator metrics recorder.
pub struct CoordinatorMetrics;

impl CoordinatorMetrics {
    /// Record a fetch primitive invocation.
    pub fn record_fetch_started(policy: FetchPolicy) {
        counter!("coordinator_fetches_started_total", "policy" => policy.as_str()).increment(1);
    }

    /// Record a request served by an in-flight fetch.
    pub fn record_dedupe_hit() {
        counter!("coordinator_dedupe_hits_total").increment(1);
    }

    /// Record an in-flight fetch cancelled by a newer request.
    pub fn record_displaced() {
        counter!("coordinator_displaced_total").increment(1);
    }

    /// Record a settled fetch.
    pub fn record_completed(outcome: &Result<FetchResult, FetchError>, duration: Duration) {
        let label = match outcome {
            Ok(_) => "fulfilled",
            Err(FetchError::Cancelled { .. }) => "cancelled",
            Err(_) => "failed",
        };
        counter!("coordinator_fetches_completed_total", "outcome" => label).increment(1);
        histogram!("coordinator_fetch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a completion whose entry was already gone.
    pub fn record_stale_cleanup_skipped() {
        counter!("coordinator_stale_cleanup_skipped_total").increment(1);
    }

    /// Record the number of keys in flight.
    pub fn set_in_flight(count: usize) {
        // Note: Precision loss acceptable for gauge values (counts < 2^52)
        #[allow(clippy::cast_precision_loss)]
        gauge!("coordinator_in_flight").set(count as f64);
    }
}

/// Lifecycle metrics recorder.
pub struct LifecycleMetrics;

impl LifecycleMetrics {
    /// Record a lifecycle transition.
    pub fn record_transition(phase: Phase) {
        counter!("lifecycle_transitions_total", "phase" => phase.as_str()).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_recorder_not_installed_renders_nothing() {
        let recorder = MetricsRecorder::new();
        assert!(recorder.handle().is_none());
        assert!(recorder.render().is_none());
    }

    #[tokio::test]
    async fn test_recorder_render() {
        let mut recorder = MetricsRecorder::default();

        recorder.start().unwrap();

        CoordinatorMetrics::record_fetch_started(FetchPolicy::Dedupe);
        CoordinatorMetrics::record_dedupe_hit();
        CoordinatorMetrics::record_completed(
            &Ok(FetchResult::new("A".into(), Utc::now())),
            Duration::from_millis(10),
        );
        LifecycleMetrics::record_transition(Phase::Pending);

        // If this test runs after another test initialized the recorder,
        // handle might be None. That's OK - metrics are still being recorded.
        if let Some(rendered) = recorder.render() {
            assert!(rendered.contains("coordinator_fetches_started_total"));
            assert!(rendered.contains("coordinator_dedupe_hits_total"));
            assert!(rendered.contains("lifecycle_transitions_total"));
        }
    }
}
