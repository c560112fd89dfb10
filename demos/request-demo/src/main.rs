//! Request demo binary
//!
//! Replays every scenario and prints the resulting event log.
//!
//! ```text
//! request-demo [delay_ms]
//! ```

use anyhow::Context;
use inflight_core::environment::SystemClock;
use inflight_core::DEFAULT_FETCH_DELAY;
use inflight_runtime::metrics::MetricsRecorder;
use inflight_runtime::{FetchPolicy, TrackerConfig};
use request_demo::{render_events, Scenarios};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "request_demo=info,inflight_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let delay = match std::env::args().nth(1) {
        Some(arg) => Duration::from_millis(
            arg.parse()
                .with_context(|| format!("delay must be a number of milliseconds, got '{arg}'"))?,
        ),
        None => DEFAULT_FETCH_DELAY,
    };

    let mut metrics = MetricsRecorder::new();
    metrics.start()?;

    println!("=== Request Demo: keyed in-flight coordination ===");
    println!("fetch delay: {}ms\n", delay.as_millis());

    let scenarios = Scenarios::new(SystemClock, TrackerConfig::default().with_fetch_delay(delay));
    let tracker = scenarios.tracker();

    println!(">>> Bad dedupe via loading flag");
    scenarios.bad_dedupe("A").await?;

    println!(">>> Direct request twice");
    scenarios.direct_twice("A").await?;

    println!(">>> Dedupe request twice");
    scenarios.dedupe_twice("A").await?;

    println!(">>> Manual dedupe (direct coordinator calls)");
    scenarios.manual_direct("A").await?;

    println!(">>> A-B-A with dedupe");
    scenarios.aba("A", FetchPolicy::Dedupe).await?;

    println!(">>> A-B-A with cancelPrevious");
    scenarios.aba("A", FetchPolicy::CancelPrevious).await?;

    let events = tracker.events().await;
    println!("\n=== Events (newest first, {} total) ===", events.len());
    print!("{}", render_events(&events));

    if let Some(latest) = events.first() {
        println!("\nLatest event as JSON:");
        println!("{}", serde_json::to_string_pretty(latest)?);
    }

    tracker.shutdown(Duration::from_secs(5)).await?;

    if let Some(rendered) = metrics.render() {
        println!("\n=== Metrics ===");
        print!("{rendered}");
    }

    Ok(())
}
