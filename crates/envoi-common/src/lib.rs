use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use utoipa::ToSchema;

pub mod logging;

// ============================================================================
// Routes
// ============================================================================

/// A destination URL that events received on a route are forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Target {
    pub value: String,
}

impl Target {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }
}

/// A registered ingestion path and the targets it fans out to.
///
/// The path is stored without a leading slash, so `/orders` and `orders`
/// identify the same route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Route {
    pub path: String,
    pub targets: Vec<Target>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

impl Route {
    pub fn new(path: &str, targets: Vec<Target>) -> Self {
        Self {
            path: normalize_path(path).to_string(),
            targets,
            tags: Vec::new(),
            created: Some(Utc::now()),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_target(mut self, value: impl Into<String>) -> Self {
        self.targets.push(Target::new(value));
        self
    }
}

/// Strip leading slashes from a route path.
pub fn normalize_path(path: &str) -> &str {
    path.trim_start_matches('/')
}

// ============================================================================
// Events
// ============================================================================

/// A captured inbound webhook request.
///
/// Immutable once appended to the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Path of the route that received the request
    pub route_id: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    #[schema(value_type = Object)]
    pub body: serde_json::Value,
    pub query_string: BTreeMap<String, String>,
    pub request_id: String,
    /// Receive time in epoch milliseconds
    pub timestamp: i64,
}

// ============================================================================
// Stream ids
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream id: {0}")]
pub struct InvalidStreamId(pub String);

/// Position of an event in a per-route log, `<millis>-<sequence>`.
///
/// Ordering is numeric on both components, which matches the order in which
/// entries were appended to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub millis: u64,
    pub seq: u64,
}

impl StreamId {
    pub const MIN: StreamId = StreamId { millis: 0, seq: 0 };
    pub const MAX: StreamId = StreamId { millis: u64::MAX, seq: u64::MAX };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Next id for an append at `now_millis`, given the last id in the log.
    ///
    /// A clock that has not moved forward (or went backwards) keeps the last
    /// millisecond and bumps the sequence.
    pub fn next_after(last: Option<StreamId>, now_millis: u64) -> StreamId {
        match last {
            Some(last) if now_millis <= last.millis => StreamId::new(last.millis, last.seq + 1),
            _ => StreamId::new(now_millis, 0),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = InvalidStreamId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidStreamId(s.to_string());
        let (millis, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(StreamId {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for StreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An event together with its position in the route's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    #[schema(value_type = String, example = "1700000000000-0")]
    pub stream_id: StreamId,
    pub data: Event,
}

// ============================================================================
// Live notifications
// ============================================================================

/// Message pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    /// A request was received but could not be recorded in the event log
    NewRequest {
        timestamp: i64,
        path: String,
        data: Event,
    },
    /// A request was recorded in the event log
    #[serde(rename_all = "camelCase")]
    NewRouteEvent {
        stream_id: StreamId,
        route_id: String,
        data: Event,
    },
}

impl Notification {
    pub fn route(&self) -> &str {
        match self {
            Notification::NewRequest { path, .. } => path,
            Notification::NewRouteEvent { route_id, .. } => route_id,
        }
    }
}

// ============================================================================
// Error bodies
// ============================================================================

/// JSON error body returned by every HTTP endpoint: `{"error":{"message":...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
            },
        }
    }
}
