//! Event Log - append-only, per-route ordered record of received events
//!
//! Ids follow the Redis stream format `<millis>-<seq>` in both adapters so
//! cursors handed out by one backend mean the same thing in the other.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use envoi_common::{Event, InvalidStreamId, StoredEvent, StreamId};
use redis::aio::ConnectionManager;
use redis::streams::StreamRangeReply;
use redis::AsyncCommands;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{Result, RouterError};

/// Default key prefix for per-route event streams
pub const STREAM_KEY_PREFIX: &str = "stream:url:";

/// Field holding the serialized event in each stream entry
const DATA_FIELD: &str = "data";

/// One end of an inclusive range query.
///
/// `-` and `+` are the earliest and latest entries. A bare millisecond value
/// covers every sequence within that millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBound {
    Earliest,
    Latest,
    Millis(u64),
    Id(StreamId),
}

impl RangeBound {
    /// Lowest id matched when used as the start of a range
    pub fn as_start(&self) -> StreamId {
        match self {
            RangeBound::Earliest => StreamId::MIN,
            RangeBound::Latest => StreamId::MAX,
            RangeBound::Millis(ms) => StreamId::new(*ms, 0),
            RangeBound::Id(id) => *id,
        }
    }

    /// Highest id matched when used as the end of a range
    pub fn as_end(&self) -> StreamId {
        match self {
            RangeBound::Earliest => StreamId::MIN,
            RangeBound::Latest => StreamId::MAX,
            RangeBound::Millis(ms) => StreamId::new(*ms, u64::MAX),
            RangeBound::Id(id) => *id,
        }
    }
}

impl fmt::Display for RangeBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeBound::Earliest => write!(f, "-"),
            RangeBound::Latest => write!(f, "+"),
            RangeBound::Millis(ms) => write!(f, "{}", ms),
            RangeBound::Id(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for RangeBound {
    type Err = InvalidStreamId;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "-" => Ok(RangeBound::Earliest),
            "+" => Ok(RangeBound::Latest),
            raw if raw.contains('-') => raw.parse().map(RangeBound::Id),
            raw => raw
                .parse()
                .map(RangeBound::Millis)
                .map_err(|_| InvalidStreamId(raw.to_string())),
        }
    }
}

/// Durable per-route event log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event and return its id. Ids strictly increase per route.
    async fn append(&self, route_id: &str, event: &Event) -> Result<StreamId>;

    /// Entries between `from` and `to` inclusive, oldest first.
    async fn range(&self, route_id: &str, from: RangeBound, to: RangeBound) -> Result<Vec<StoredEvent>>;

    /// Set or refresh the time-to-live of a route's log.
    async fn expire(&self, route_id: &str, horizon: Duration) -> Result<()>;

    /// Entries between `from` and `to`, newest first, at most `limit` of them.
    async fn history(
        &self,
        route_id: &str,
        from: RangeBound,
        to: RangeBound,
        limit: usize,
    ) -> Result<Vec<StoredEvent>> {
        let mut entries = self.range(route_id, from, to).await?;
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Default)]
struct RouteStream {
    entries: Vec<StoredEvent>,
    expires_at: Option<Instant>,
}

impl RouteStream {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

/// Event log held in process memory.
///
/// A route's log disappears as a whole once its TTL lapses, the same way an
/// expired Redis key does.
#[derive(Default)]
pub struct InMemoryEventLog {
    streams: DashMap<String, RouteStream>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries for a route
    pub fn len(&self, route_id: &str) -> usize {
        self.streams
            .get(route_id)
            .filter(|stream| !stream.is_expired())
            .map(|stream| stream.entries.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, route_id: &str, event: &Event) -> Result<StreamId> {
        // The entry guard holds the shard lock, so concurrent appends on
        // one route serialize here.
        let mut stream = self.streams.entry(route_id.to_string()).or_default();
        if stream.is_expired() {
            *stream = RouteStream::default();
        }

        let last = stream.entries.last().map(|entry| entry.stream_id);
        let stream_id = StreamId::next_after(last, now_millis());
        stream.entries.push(StoredEvent {
            stream_id,
            data: event.clone(),
        });

        Ok(stream_id)
    }

    async fn range(&self, route_id: &str, from: RangeBound, to: RangeBound) -> Result<Vec<StoredEvent>> {
        let start = from.as_start();
        let end = to.as_end();

        if let Some((_, stream)) = self.streams.remove_if(route_id, |_, stream| stream.is_expired()) {
            debug!(route = %route_id, entries = stream.entries.len(), "Route log expired");
            return Ok(Vec::new());
        }

        Ok(self
            .streams
            .get(route_id)
            .map(|stream| {
                stream
                    .entries
                    .iter()
                    .filter(|entry| entry.stream_id >= start && entry.stream_id <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn expire(&self, route_id: &str, horizon: Duration) -> Result<()> {
        if let Some(mut stream) = self.streams.get_mut(route_id) {
            stream.expires_at = Some(Instant::now() + horizon);
        }
        Ok(())
    }
}

/// Event log backed by Redis streams, one stream per route.
pub struct RedisEventLog {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisEventLog {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: STREAM_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, route_id: &str) -> String {
        format!("{}{}", self.key_prefix, route_id)
    }
}

/// Decode stream entries, skipping any whose payload is unreadable.
fn decode_entries(route_id: &str, reply: StreamRangeReply) -> Vec<StoredEvent> {
    reply
        .ids
        .into_iter()
        .filter_map(|entry| {
            let stream_id: StreamId = match entry.id.parse() {
                Ok(id) => id,
                Err(e) => {
                    warn!(route = %route_id, error = %e, "Skipping entry with unparseable id");
                    return None;
                }
            };
            let raw: String = entry.get(DATA_FIELD)?;
            match serde_json::from_str::<Event>(&raw) {
                Ok(data) => Some(StoredEvent { stream_id, data }),
                Err(e) => {
                    warn!(route = %route_id, stream_id = %stream_id, error = %e, "Skipping undecodable entry");
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn append(&self, route_id: &str, event: &Event) -> Result<StreamId> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(self.key(route_id), "*", &[(DATA_FIELD, payload)])
            .await?;

        id.parse()
            .map_err(|e: InvalidStreamId| RouterError::Storage(e.to_string()))
    }

    async fn range(&self, route_id: &str, from: RangeBound, to: RangeBound) -> Result<Vec<StoredEvent>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn
            .xrange(self.key(route_id), from.to_string(), to.to_string())
            .await?;
        Ok(decode_entries(route_id, reply))
    }

    async fn expire(&self, route_id: &str, horizon: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let seconds = i64::try_from(horizon.as_secs()).unwrap_or(i64::MAX);
        let _: bool = conn.expire(self.key(route_id), seconds).await?;
        Ok(())
    }

    async fn history(
        &self,
        route_id: &str,
        from: RangeBound,
        to: RangeBound,
        limit: usize,
    ) -> Result<Vec<StoredEvent>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn
            .xrevrange_count(self.key(route_id), to.to_string(), from.to_string(), limit)
            .await?;
        Ok(decode_entries(route_id, reply))
    }
}
