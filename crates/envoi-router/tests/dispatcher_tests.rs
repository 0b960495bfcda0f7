//! Dispatcher Tests
//!
//! Tests for:
//! - One append, one task per target and one broadcast per request
//! - Unknown routes answered with NotFound and no side effects
//! - Prefix handling and path normalization
//! - Append failures skipping delivery but still notifying
//! - Event construction (method, query, body, request id)

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use envoi_common::{Event, Notification, Route, StoredEvent, StreamId, Target};
use envoi_router::{
    Broadcaster, DeliverySink, DeliveryTask, Dispatcher, EventLog, InMemoryEventLog, InMemoryRouteRegistry,
    InboundRequest, RangeBound, Result, RouterError,
};

/// Event log that counts calls and can be told to fail appends
#[derive(Default)]
struct RecordingEventLog {
    inner: InMemoryEventLog,
    appends: AtomicU32,
    expires: Mutex<Vec<(String, Duration)>>,
    fail_appends: AtomicBool,
}

#[async_trait]
impl EventLog for RecordingEventLog {
    async fn append(&self, route_id: &str, event: &Event) -> Result<StreamId> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(RouterError::Storage("connection reset".to_string()));
        }
        self.inner.append(route_id, event).await
    }

    async fn range(&self, route_id: &str, from: RangeBound, to: RangeBound) -> Result<Vec<StoredEvent>> {
        self.inner.range(route_id, from, to).await
    }

    async fn expire(&self, route_id: &str, horizon: Duration) -> Result<()> {
        self.expires.lock().push((route_id.to_string(), horizon));
        self.inner.expire(route_id, horizon).await
    }
}

#[derive(Default)]
struct RecordingSink {
    tasks: Mutex<Vec<DeliveryTask>>,
}

impl DeliverySink for RecordingSink {
    fn submit(&self, task: DeliveryTask) -> Result<()> {
        self.tasks.lock().push(task);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingBroadcaster {
    notifications: Mutex<Vec<Notification>>,
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, notification: &Notification) -> usize {
        self.notifications.lock().push(notification.clone());
        1
    }
}

struct Harness {
    registry: Arc<InMemoryRouteRegistry>,
    log: Arc<RecordingEventLog>,
    sink: Arc<RecordingSink>,
    broadcaster: Arc<RecordingBroadcaster>,
    dispatcher: Dispatcher,
}

fn harness(routes: Vec<Route>) -> Harness {
    let registry = Arc::new(InMemoryRouteRegistry::with_routes(routes));
    let log = Arc::new(RecordingEventLog::default());
    let sink = Arc::new(RecordingSink::default());
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let dispatcher = Dispatcher::new(registry.clone(), log.clone(), sink.clone(), broadcaster.clone());

    Harness {
        registry,
        log,
        sink,
        broadcaster,
        dispatcher,
    }
}

fn orders_route(targets: &[&str]) -> Route {
    Route::new("orders", targets.iter().map(|t| Target::new(*t)).collect())
}

#[tokio::test]
async fn test_n_targets_one_append_n_tasks_one_broadcast() {
    let h = harness(vec![orders_route(&[
        "https://a.test/hook",
        "https://b.test/hook",
        "https://c.test/hook",
    ])]);

    let outcome = h
        .dispatcher
        .handle(InboundRequest::new("POST", "/webhook/orders").with_body(r#"{"id":1}"#))
        .await
        .unwrap();

    assert_eq!(outcome.route_id, "orders");
    assert_eq!(outcome.scheduled, 3);
    assert_eq!(h.log.appends.load(Ordering::SeqCst), 1);

    let tasks = h.sink.tasks.lock();
    let targets: Vec<&str> = tasks.iter().map(|t| t.target.value.as_str()).collect();
    assert_eq!(targets, vec!["https://a.test/hook", "https://b.test/hook", "https://c.test/hook"]);
    assert!(tasks.iter().all(|t| Some(t.stream_id) == outcome.stream_id && t.attempt == 0));

    let notifications = h.broadcaster.notifications.lock();
    assert_eq!(notifications.len(), 1);
    match &notifications[0] {
        Notification::NewRouteEvent { stream_id, route_id, data } => {
            assert_eq!(Some(*stream_id), outcome.stream_id);
            assert_eq!(route_id, "orders");
            assert_eq!(data.body, serde_json::json!({"id": 1}));
        }
        other => panic!("unexpected notification {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_route_has_no_side_effects() {
    let h = harness(vec![orders_route(&["https://a.test/hook"])]);

    let err = h
        .dispatcher
        .handle(InboundRequest::new("GET", "/webhook/unknown-path"))
        .await
        .unwrap_err();

    assert!(matches!(&err, RouterError::NotFound(path) if path == "unknown-path"));
    assert_eq!(err.to_string(), "Path unknown-path not found");
    assert_eq!(h.log.appends.load(Ordering::SeqCst), 0);
    assert!(h.sink.tasks.lock().is_empty());
    assert!(h.broadcaster.notifications.lock().is_empty());
}

#[tokio::test]
async fn test_lookup_is_exact() {
    let h = harness(vec![orders_route(&["https://a.test/hook"])]);

    let err = h
        .dispatcher
        .handle(InboundRequest::new("POST", "/webhook/orders/123"))
        .await
        .unwrap_err();

    assert!(matches!(err, RouterError::NotFound(path) if path == "orders/123"));
}

#[tokio::test]
async fn test_path_outside_prefix_is_a_routing_error() {
    let h = harness(vec![orders_route(&["https://a.test/hook"])]);

    for path in ["/orders", "/webhooks/orders", "/web"] {
        let err = h.dispatcher.handle(InboundRequest::new("POST", path)).await.unwrap_err();
        assert!(matches!(err, RouterError::Routing(_)), "{} should not match", path);
    }
    assert_eq!(h.log.appends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_custom_prefix_and_leading_slashes() {
    let h = harness(vec![orders_route(&["https://a.test/hook"])]);
    let dispatcher = Dispatcher::new(h.registry.clone(), h.log.clone(), h.sink.clone(), h.broadcaster.clone())
        .with_prefix("/hooks/");

    assert_eq!(dispatcher.route_path("/hooks//orders").unwrap(), "orders");

    let outcome = dispatcher
        .handle(InboundRequest::new("POST", "/hooks//orders"))
        .await
        .unwrap();
    assert_eq!(outcome.route_id, "orders");
}

#[tokio::test]
async fn test_zero_targets_is_not_a_failure() {
    let h = harness(vec![Route::new("empty", Vec::new())]);

    let outcome = h
        .dispatcher
        .handle(InboundRequest::new("POST", "/webhook/empty"))
        .await
        .unwrap();

    assert_eq!(outcome.scheduled, 0);
    assert!(outcome.stream_id.is_some());
    assert_eq!(h.log.appends.load(Ordering::SeqCst), 1);
    assert_eq!(h.broadcaster.notifications.lock().len(), 1);
}

#[tokio::test]
async fn test_duplicate_targets_are_delivered_twice() {
    let h = harness(vec![orders_route(&["https://a.test/hook", "https://a.test/hook"])]);

    h.dispatcher
        .handle(InboundRequest::new("POST", "/webhook/orders"))
        .await
        .unwrap();

    assert_eq!(h.sink.tasks.lock().len(), 2);
}

#[tokio::test]
async fn test_append_failure_skips_delivery_but_notifies() {
    let h = harness(vec![orders_route(&["https://a.test/hook"])]);
    h.log.fail_appends.store(true, Ordering::SeqCst);

    let outcome = h
        .dispatcher
        .handle(InboundRequest::new("POST", "/webhook/orders"))
        .await
        .unwrap();

    assert!(outcome.stream_id.is_none());
    assert_eq!(outcome.scheduled, 0);
    assert!(h.sink.tasks.lock().is_empty());
    assert!(h.log.expires.lock().is_empty());

    let notifications = h.broadcaster.notifications.lock();
    assert_eq!(notifications.len(), 1);
    assert!(matches!(&notifications[0], Notification::NewRequest { path, .. } if path == "orders"));
}

#[tokio::test]
async fn test_successful_append_refreshes_retention() {
    let h = harness(vec![orders_route(&["https://a.test/hook"])]);

    h.dispatcher
        .handle(InboundRequest::new("POST", "/webhook/orders"))
        .await
        .unwrap();

    assert_eq!(
        *h.log.expires.lock(),
        vec![("orders".to_string(), Duration::from_secs(7 * 24 * 60 * 60))]
    );
}

#[tokio::test]
async fn test_event_captures_request() {
    let h = harness(vec![orders_route(&["https://a.test/hook"])]);

    h.dispatcher
        .handle(
            InboundRequest::new("put", "/webhook/orders")
                .with_header("Content-Type", "application/x-www-form-urlencoded")
                .with_header("X-Shop", "demo")
                .with_query("source", "shop")
                .with_body("status=paid&total=12.50"),
        )
        .await
        .unwrap();

    let entries = h
        .log
        .range("orders", RangeBound::Earliest, RangeBound::Latest)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);

    let event = &entries[0].data;
    assert_eq!(event.route_id, "orders");
    assert_eq!(event.method, "PUT");
    assert_eq!(event.headers.get("x-shop").map(String::as_str), Some("demo"));
    assert_eq!(event.query_string.get("source").map(String::as_str), Some("shop"));
    assert_eq!(event.body, serde_json::json!({"status": "paid", "total": "12.50"}));
    assert!(!event.request_id.is_empty());
    assert!(event.timestamp > 0);
}

#[tokio::test]
async fn test_request_id_is_kept() {
    let h = harness(vec![orders_route(&["https://a.test/hook"])]);

    let mut request = InboundRequest::new("POST", "/webhook/orders");
    request.request_id = Some("req-from-caller".to_string());
    h.dispatcher.handle(request).await.unwrap();

    assert_eq!(h.sink.tasks.lock()[0].event.request_id, "req-from-caller");
}

#[tokio::test]
async fn test_in_order_requests_are_logged_in_order() {
    let h = harness(vec![orders_route(&[])]);

    for i in 0..10 {
        let mut request = InboundRequest::new("POST", "/webhook/orders");
        request.request_id = Some(format!("req-{}", i));
        h.dispatcher.handle(request).await.unwrap();
    }

    let entries = h
        .log
        .range("orders", RangeBound::Earliest, RangeBound::Latest)
        .await
        .unwrap();
    let request_ids: Vec<String> = entries.iter().map(|e| e.data.request_id.clone()).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("req-{}", i)).collect();
    assert_eq!(request_ids, expected);
}
