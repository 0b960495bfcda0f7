//! Dispatcher - turns one inbound webhook into an event, delivery tasks and
//! a live notification
//!
//! The caller gets its answer as soon as the work has been handed off:
//! delivery runs on the scheduler's workers and fan-out never blocks.

use bytes::Bytes;
use chrono::Utc;
use envoi_common::{normalize_path, Event, Notification, StreamId};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::event_log::EventLog;
use crate::fanout::Broadcaster;
use crate::metrics;
use crate::registry::RouteRegistry;
use crate::scheduler::{DeliverySink, DeliveryTask};
use crate::{Result, RouterError};

pub const DEFAULT_PREFIX: &str = "/webhook";
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// An inbound request, already lifted out of the HTTP framework.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub method: String,
    /// Full request path, prefix included
    pub path: String,
    /// Header names lower-cased; repeated headers joined with `, `
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Bytes,
    pub request_id: Option<String>,
}

impl InboundRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }
}

/// What the dispatcher did with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub route_id: String,
    /// Log position, absent when the append failed
    pub stream_id: Option<StreamId>,
    /// Delivery tasks accepted by the scheduler
    pub scheduled: usize,
    /// Subscribers the notification reached
    pub notified: usize,
}

pub struct Dispatcher {
    registry: Arc<dyn RouteRegistry>,
    event_log: Arc<dyn EventLog>,
    sink: Arc<dyn DeliverySink>,
    broadcaster: Arc<dyn Broadcaster>,
    prefix: String,
    retention: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn RouteRegistry>,
        event_log: Arc<dyn EventLog>,
        sink: Arc<dyn DeliverySink>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            registry,
            event_log,
            sink,
            broadcaster,
            prefix: DEFAULT_PREFIX.to_string(),
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Route path carried by a request path, without its leading slash.
    pub fn route_path<'a>(&self, path: &'a str) -> Result<&'a str> {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => Ok(normalize_path(rest)),
            _ => Err(RouterError::Routing("no path match".to_string())),
        }
    }

    pub async fn handle(&self, request: InboundRequest) -> Result<DispatchOutcome> {
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = info_span!("dispatch", request_id = %request_id, method = %request.method);

        self.dispatch(request, request_id).instrument(span).await
    }

    async fn dispatch(&self, request: InboundRequest, request_id: String) -> Result<DispatchOutcome> {
        let path = self.route_path(&request.path)?.to_string();

        let route = match self.registry.lookup(&path).await? {
            Some(route) => route,
            None => {
                debug!(route = %path, "No route registered");
                return Err(RouterError::NotFound(path));
            }
        };
        metrics::record_event_received(&route.path);

        let event = Arc::new(Event {
            route_id: route.path.clone(),
            method: request.method.to_uppercase(),
            body: parse_body(request.content_type(), &request.body),
            headers: request.headers,
            query_string: request.query,
            request_id,
            timestamp: Utc::now().timestamp_millis(),
        });

        let stream_id = match self.event_log.append(&route.path, &event).await {
            Ok(stream_id) => {
                metrics::record_append(&route.path, true);
                if let Err(e) = self.event_log.expire(&route.path, self.retention).await {
                    warn!(route = %route.path, error = %e, "Failed to refresh event log retention");
                }
                Some(stream_id)
            }
            Err(e) => {
                metrics::record_append(&route.path, false);
                error!(route = %route.path, error = %e, "Failed to append event, skipping delivery");
                None
            }
        };

        let mut scheduled = 0;
        if let Some(stream_id) = stream_id {
            for target in &route.targets {
                let task = DeliveryTask::new(route.path.clone(), stream_id, event.clone(), target.clone());
                match self.sink.submit(task) {
                    Ok(()) => scheduled += 1,
                    Err(e) => error!(
                        route = %route.path,
                        target = %target.value,
                        stream_id = %stream_id,
                        error = %e,
                        "Failed to schedule delivery"
                    ),
                }
            }
        }

        let notification = match stream_id {
            Some(stream_id) => Notification::NewRouteEvent {
                stream_id,
                route_id: route.path.clone(),
                data: (*event).clone(),
            },
            None => Notification::NewRequest {
                timestamp: event.timestamp,
                path: route.path.clone(),
                data: (*event).clone(),
            },
        };
        let notified = self.broadcaster.broadcast(&notification);

        info!(
            route = %route.path,
            stream_id = ?stream_id.map(|id| id.to_string()),
            targets = route.targets.len(),
            scheduled,
            notified,
            "Webhook dispatched"
        );

        Ok(DispatchOutcome {
            route_id: route.path,
            stream_id,
            scheduled,
            notified,
        })
    }
}

/// Decode a request body into the JSON value stored with the event.
///
/// Empty bodies become `{}`, form posts become an object, JSON is kept as
/// parsed, and anything else is kept as text.
pub fn parse_body(content_type: Option<&str>, body: &[u8]) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Object(Map::new());
    }

    let is_form = content_type
        .map(|ct| ct.to_ascii_lowercase().starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if is_form {
        let fields = parse_urlencoded(&String::from_utf8_lossy(body));
        return Value::Object(fields.into_iter().map(|(k, v)| (k, Value::String(v))).collect());
    }

    match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => Value::String(String::from_utf8_lossy(body).into_owned()),
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Parse `a=1&b=two+words` pairs. Later duplicates win; keys without a
/// value map to an empty string.
pub fn parse_urlencoded(raw: &str) -> BTreeMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}
