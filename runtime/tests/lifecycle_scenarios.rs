//! Integration tests for the lifecycle tracker
//!
//! Replays the request patterns the tracker is meant to make visible and
//! checks the resulting event log.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use inflight_core::{Key, RequestEvent, SimulatedFetcher};
use inflight_runtime::{FetchPolicy, LifecycleTracker, RequestMode, TrackerConfig};
use inflight_testing::{init_test_tracing, CountingFetcher, SteppingClock, TEST_FETCH_DELAY};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

type TestFetcher = CountingFetcher<SimulatedFetcher<SteppingClock>>;

fn tracker() -> (LifecycleTracker<SteppingClock>, TestFetcher) {
    init_test_tracing();
    let clock = SteppingClock::default();
    let fetcher = CountingFetcher::new(SimulatedFetcher::new(clock.clone()));
    let config = TrackerConfig::default().with_fetch_delay(TEST_FETCH_DELAY);
    (LifecycleTracker::with_fetcher(clock, fetcher.clone(), config), fetcher)
}

fn sources(events: &[RequestEvent]) -> Vec<&str> {
    events.iter().map(|e| e.source.as_str()).collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn loading_flag_is_not_a_dedupe_key() {
    let (tracker, fetcher) = tracker();

    let mut direct = tracker.request("A", RequestMode::Direct).await.unwrap();
    assert!(tracker.loading().await);

    // Guarding on the global flag blocks an unrelated key
    if tracker.loading().await {
        tracker
            .push_event(RequestEvent::new(
                "bad-dedupe:B",
                Key::from("B"),
                chrono::Utc::now(),
                "bad-dedupe-block",
            ))
            .await
            .unwrap();
    }

    direct.wait().await;

    let events = tracker.events().await;
    assert_eq!(
        sources(&events),
        vec!["thunk-fulfilled", "bad-dedupe-block", "thunk-pending"]
    );
    assert_eq!(fetcher.calls_for("B"), 0);
}

#[tokio::test]
async fn direct_twice_fetches_twice() {
    let (tracker, fetcher) = tracker();

    let mut first = tracker.request("A", RequestMode::Direct).await.unwrap();
    let mut second = tracker.request("A", RequestMode::Direct).await.unwrap();
    first.wait().await;
    second.wait().await;

    let events = tracker.events().await;
    assert_eq!(events.len(), 4);
    assert_eq!(&sources(&events)[2..], ["thunk-pending", "thunk-pending"]);
    assert_eq!(fetcher.calls_for("A"), 2);
}

#[tokio::test]
async fn dedupe_twice_fetches_once() {
    let (tracker, fetcher) = tracker();

    let mut first = tracker.request("A", RequestMode::Dedupe).await.unwrap();
    let mut second = tracker.request("A", RequestMode::Dedupe).await.unwrap();
    first.wait().await;
    second.wait().await;

    let events = tracker.events().await;
    assert_eq!(
        sources(&events),
        vec!["dedupe-fulfilled", "dedupe-fulfilled", "dedupe-pending", "dedupe-pending"]
    );
    assert_eq!(fetcher.calls_for("A"), 1);
}

#[tokio::test]
async fn manual_direct_dedupe_shares_result() {
    let (tracker, fetcher) = tracker();
    let coordinator = tracker.coordinator().clone();

    let first = coordinator.fetch_with_dedupe("A");
    let second = coordinator.fetch_with_dedupe("A");
    let (first, second) = tokio::join!(first, second);

    for (result, source) in [(first, "manual-direct"), (second, "manual-direct-2")] {
        let result = result.unwrap();
        tracker
            .push_event(RequestEvent::new(
                format!("{source}:{}", result.key),
                result.key,
                result.timestamp,
                source,
            ))
            .await
            .unwrap();
    }

    let events = tracker.events().await;
    assert_eq!(sources(&events), vec!["manual-direct-2", "manual-direct"]);
    assert_eq!(events[0].timestamp, events[1].timestamp);
    assert_eq!(fetcher.calls_for("A"), 1);
}

#[tokio::test]
async fn aba_policy_divergence_through_tracker() {
    let (tracker, _) = tracker();

    for policy in [FetchPolicy::Dedupe, FetchPolicy::CancelPrevious] {
        tracker.clear_events().await.unwrap();
        let mode = RequestMode::Policy(policy);

        let mut a1 = tracker.request("A", mode).await.unwrap();
        let mut b = tracker.request("A-B", mode).await.unwrap();
        let mut a2 = tracker.request("A", mode).await.unwrap();
        for request in [&mut a1, &mut b, &mut a2] {
            request.wait().await;
        }

        let events = tracker.events().await;
        let a1_rejected = events.iter().any(|e| e.id == format!("rejected:{}", a1.id));
        match policy {
            FetchPolicy::Dedupe => assert!(!a1_rejected),
            FetchPolicy::CancelPrevious => assert!(a1_rejected),
        }
        assert!(events.iter().any(|e| e.id == format!("fulfilled:{}", a2.id)));
        assert!(events.iter().any(|e| e.id == format!("fulfilled:{}", b.id)));
        assert_eq!(tracker.coordinator().in_flight_count(), 0);
    }
}

#[tokio::test]
async fn subscriber_sees_every_terminal_transition() {
    let (tracker, _) = tracker();
    let mut rx = tracker.subscribe();

    let first = tracker.request("A", RequestMode::Dedupe).await.unwrap();
    let second = tracker.request("B", RequestMode::Direct).await.unwrap();

    let mut settled = Vec::new();
    for _ in 0..2 {
        let action = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        settled.push(action.request_id().unwrap());
    }

    assert!(settled.contains(&first.id));
    assert!(settled.contains(&second.id));
}
