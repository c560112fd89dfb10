//! Lifecycle events and the bounded event log.
//!
//! Every lifecycle transition of a logical request is recorded as an
//! immutable [`RequestEvent`]. Events are kept in an [`EventLog`], newest
//! first, bounded to the most recent [`DEFAULT_EVENT_CAPACITY`] entries.

use crate::key::Key;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

/// Number of events retained by [`EventLog::default`]
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Identifier of one logical request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Phase of a request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Request accepted, work not yet settled
    Pending,
    /// Work succeeded (terminal)
    Fulfilled,
    /// Work failed or was cancelled (terminal)
    Rejected,
}

impl Phase {
    /// Lowercase name used in event ids and sources
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fulfilled => "fulfilled",
            Self::Rejected => "rejected",
        }
    }

    /// Whether the phase is terminal
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEvent {
    /// Unique per transition
    pub id: String,
    /// Key of the request
    pub key: Key,
    /// When the transition happened (or the resolved timestamp on success)
    pub timestamp: DateTime<Utc>,
    /// Human-readable origin tag, e.g. `dedupe-pending`
    pub source: String,
}

impl RequestEvent {
    /// Create an event with explicit fields
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        key: Key,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            key,
            timestamp,
            source: source.into(),
        }
    }

    /// Create the event for `phase` of request `request_id`
    ///
    /// The id is `{phase}:{request_id}` and the source is `{origin}-{phase}`.
    #[must_use]
    pub fn transition(
        phase: Phase,
        request_id: RequestId,
        origin: &str,
        key: Key,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("{phase}:{request_id}"),
            key,
            timestamp,
            source: format!("{origin}-{phase}"),
        }
    }
}

/// Newest-first event sequence bounded to a fixed capacity
///
/// Once the capacity is exceeded the oldest event is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLog {
    events: VecDeque<RequestEvent>,
    capacity: usize,
}

impl EventLog {
    /// Create an empty log retaining at most `capacity` events
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_CAPACITY)),
            capacity,
        }
    }

    /// Record an event as the newest entry
    pub fn push(&mut self, event: RequestEvent) {
        self.events.push_front(event);
        if self.events.len() > self.capacity {
            self.events.pop_back();
        }
    }

    /// Remove all events
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Number of retained events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum number of retained events
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent event
    #[must_use]
    pub fn latest(&self) -> Option<&RequestEvent> {
        self.events.front()
    }

    /// Iterate newest first
    pub fn iter(&self) -> impl Iterator<Item = &RequestEvent> {
        self.events.iter()
    }

    /// Copy the events out, newest first
    #[must_use]
    pub fn to_vec(&self) -> Vec<RequestEvent> {
        self.events.iter().cloned().collect()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}
