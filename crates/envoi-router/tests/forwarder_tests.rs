//! HttpForwarder Tests
//!
//! Tests for:
//! - Method, query string and JSON body replayed to the target
//! - Non-success statuses returned as completed responses
//! - Transport failures classified as delivery errors
//! - Truncated response bodies retried rather than counted as delivered

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use envoi_common::{Event, StreamId, Target};
use envoi_router::{
    run_delivery, DeliveryErrorKind, DeliveryOutcome, DeliveryTask, Forwarder, HttpForwarder, HttpForwarderConfig,
    RetryPolicy, SleepBackoff,
};

fn create_task(method: &str, target: &str, body: serde_json::Value, query: &[(&str, &str)]) -> DeliveryTask {
    let event = Event {
        route_id: "orders".to_string(),
        method: method.to_string(),
        headers: BTreeMap::new(),
        body,
        query_string: query.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        request_id: "req-1".to_string(),
        timestamp: 1_700_000_000_000,
    };
    DeliveryTask::new("orders", StreamId::new(1, 0), Arc::new(event), Target::new(target))
}

fn forwarder() -> HttpForwarder {
    HttpForwarder::new(HttpForwarderConfig {
        connect_timeout: Duration::from_secs(1),
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_replays_method_query_and_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/hook"))
        .and(query_param("source", "shop"))
        .and(body_json(serde_json::json!({"orderId": 42})))
        .respond_with(ResponseTemplate::new(201).insert_header("x-upstream", "yes"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let task = create_task(
        "PUT",
        &format!("{}/hook", mock_server.uri()),
        serde_json::json!({"orderId": 42}),
        &[("source", "shop")],
    );

    let response = forwarder().forward(&task).await.unwrap();

    assert_eq!(response.status, 201);
    assert!(response.is_success());
    assert_eq!(response.headers.get("x-upstream").map(String::as_str), Some("yes"));
}

#[tokio::test]
async fn test_lowercase_method_is_normalized() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let task = create_task("post", &format!("{}/hook", mock_server.uri()), serde_json::json!({}), &[]);

    assert_eq!(forwarder().forward(&task).await.unwrap().status, 200);
}

#[tokio::test]
async fn test_server_error_is_a_completed_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let task = create_task("POST", &format!("{}/hook", mock_server.uri()), serde_json::json!({"a": 1}), &[]);

    let response = forwarder().forward(&task).await.unwrap();

    assert_eq!(response.status, 503);
    assert!(!response.is_success());
    assert_eq!(response.body, "maintenance");
}

#[tokio::test]
async fn test_connection_refused_is_a_delivery_error() {
    // Bind then release a port so nothing is listening on it.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let task = create_task("POST", &format!("http://127.0.0.1:{}/hook", port), serde_json::json!({}), &[]);

    let err = forwarder().forward(&task).await.unwrap_err();

    assert_eq!(err.kind, DeliveryErrorKind::Connect);
    assert!(err.status.is_none());
}

#[tokio::test]
async fn test_invalid_method_is_a_request_error() {
    let task = create_task("NOT A METHOD", "http://127.0.0.1:1/hook", serde_json::json!({}), &[]);

    let err = forwarder().forward(&task).await.unwrap_err();

    assert_eq!(err.kind, DeliveryErrorKind::Request);
}

/// Target that announces a 100 byte body, sends 3 bytes and hangs up.
async fn spawn_truncating_target() -> (String, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicU32::new(0));

    let counter = connections.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);

            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nabc")
                .await;
            let _ = socket.flush().await;
            drop(socket);
        }
    });

    (format!("http://{}/hook", addr), connections)
}

#[tokio::test]
async fn test_truncated_body_is_a_delivery_error() {
    let (target, _) = spawn_truncating_target().await;
    let task = create_task("POST", &target, serde_json::json!({"a": 1}), &[]);

    let err = forwarder().forward(&task).await.unwrap_err();

    assert_ne!(err.kind, DeliveryErrorKind::Timeout);
}

#[tokio::test]
async fn test_truncated_body_is_retried_until_exhausted() {
    let (target, connections) = spawn_truncating_target().await;
    let task = create_task("POST", &target, serde_json::json!({"a": 1}), &[]);
    let policy = RetryPolicy {
        max_attempts: 3,
        backoff: Duration::from_millis(10),
        attempt_timeout: Duration::from_secs(5),
    };

    let outcome = run_delivery(task, &forwarder(), &policy, &SleepBackoff, None).await;

    assert!(
        matches!(outcome, DeliveryOutcome::Exhausted { attempts: 3, .. }),
        "unexpected outcome {:?}",
        outcome
    );
    assert_eq!(connections.load(Ordering::SeqCst), 3);
}
