//! Envoi HTTP API
//!
//! HTTP API endpoints for:
//! - Webhook ingestion under the configured prefix
//! - Event history per route
//! - Live event feed over WebSocket
//! - Health, monitoring and Kubernetes probes
//! - Prometheus metrics and OpenAPI docs

use axum::{
    body::Bytes,
    extract::{
        rejection::QueryRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, RawQuery, State,
    },
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use envoi_common::{normalize_path, ErrorBody, ErrorDetail, Event, StoredEvent};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::dispatcher::{parse_urlencoded, Dispatcher, InboundRequest};
use crate::event_log::{EventLog, RangeBound};
use crate::fanout::{FanOut, Subscription};
use crate::scheduler::{ForwardScheduler, SchedulerStats};
use crate::RouterError;

pub mod auth;
pub mod model;

use auth::{presented_token, TOKEN_QUERY_PARAM};
use model::{HistoryQuery, MessageResponse, MonitoringResponse, ProbeResponse, SimpleHealthResponse};

/// Header carrying a caller-supplied request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub event_log: Arc<dyn EventLog>,
    pub fanout: Arc<FanOut>,
    pub scheduler: Arc<ForwardScheduler>,
    /// Default page size for the history endpoint
    pub history_limit: usize,
    /// Prometheus recorder, when one is installed
    pub prometheus: Option<PrometheusHandle>,
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let status = match &self {
            RouterError::NotFound(_) => StatusCode::NOT_FOUND,
            RouterError::Unauthorized => StatusCode::UNAUTHORIZED,
            RouterError::Storage(_)
            | RouterError::Redis(_)
            | RouterError::QueueFull
            | RouterError::ShutdownInProgress => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::Routing(_)
            | RouterError::Delivery(_)
            | RouterError::Config(_)
            | RouterError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "Request failed");
        }

        (status, Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody::new(message))).into_response()
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Envoi Webhook Router API",
        version = "0.1.0",
        description = "Receives webhooks, records them per route and relays them to configured targets"
    ),
    paths(
        ingest_handler,
        history_handler,
        ws_handler,
        health_handler,
        liveness_probe,
        readiness_probe,
        metrics_handler,
        monitoring_handler,
    ),
    components(schemas(
        MessageResponse,
        ErrorBody,
        ErrorDetail,
        Event,
        StoredEvent,
        SimpleHealthResponse,
        ProbeResponse,
        MonitoringResponse,
        SchedulerStats,
    )),
    tags(
        (name = "webhooks", description = "Webhook ingestion"),
        (name = "events", description = "Event history and live feed"),
        (name = "health", description = "Health check endpoints"),
        (name = "monitoring", description = "Monitoring and metrics endpoints"),
    )
)]
pub struct ApiDoc;

/// Create the full router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let ingest_path = format!("{}/*path", state.dispatcher.prefix());

    Router::new()
        // Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        // Ingestion
        .route(&ingest_path, any(ingest_handler))
        // Events
        .route("/route/events", get(history_handler))
        .route("/ws", get(ws_handler))
        // Health
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        // Monitoring
        .route("/metrics", get(metrics_handler))
        .route("/monitoring", get(monitoring_handler))
        .with_state(state)
}

// ============================================================================
// Ingestion
// ============================================================================

/// Header map with lower-case names, repeated values joined by `, `
fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut collected: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        collected
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    collected
}

/// Receive a webhook on a registered route
#[utoipa::path(
    post,
    path = "/webhook/{path}",
    tag = "webhooks",
    params(
        ("path" = String, Path, description = "Registered route path; any HTTP method is accepted")
    ),
    request_body(content = Object, description = "Any payload: JSON, form fields or text"),
    responses(
        (status = 200, description = "Webhook accepted", body = MessageResponse),
        (status = 404, description = "No route registered for the path", body = ErrorBody),
        (status = 500, description = "Request reached the handler outside the prefix", body = ErrorBody)
    )
)]
async fn ingest_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = urlencoding::decode(uri.path())
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| uri.path().to_string());

    let request = InboundRequest {
        method: method.as_str().to_string(),
        path,
        query: uri.query().map(parse_urlencoded).unwrap_or_default(),
        request_id: headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string),
        headers: collect_headers(&headers),
        body,
    };

    match state.dispatcher.handle(request).await {
        Ok(_) => Json(MessageResponse::ok()).into_response(),
        Err(e) => e.into_response(),
    }
}

// ============================================================================
// Events
// ============================================================================

/// Recorded events for a route, newest first
#[utoipa::path(
    get,
    path = "/route/events",
    tag = "events",
    params(HistoryQuery),
    responses(
        (status = 200, description = "Events, newest first", body = [StoredEvent]),
        (status = 400, description = "Missing path, malformed cursor or limit", body = ErrorBody),
        (status = 401, description = "Missing or wrong token", body = ErrorBody),
        (status = 503, description = "Event log unavailable", body = ErrorBody)
    )
)]
async fn history_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: std::result::Result<Query<HistoryQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let token = presented_token(&headers, query.token.as_deref());
    if !state.fanout.authorize(token.as_deref()) {
        return RouterError::Unauthorized.into_response();
    }

    let from = match query.from.as_deref().unwrap_or("-").parse::<RangeBound>() {
        Ok(bound) => bound,
        Err(e) => return bad_request(format!("from: {}", e)),
    };
    let to = match query.to.as_deref().unwrap_or("+").parse::<RangeBound>() {
        Ok(bound) => bound,
        Err(e) => return bad_request(format!("to: {}", e)),
    };
    let limit = query.limit.unwrap_or(state.history_limit);
    let route = normalize_path(&query.path);

    match state.event_log.history(route, from, to, limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => {
            warn!(route = %route, error = %e, "Failed to read event history");
            RouterError::Storage(e.to_string()).into_response()
        }
    }
}

/// Live feed of new events
#[utoipa::path(
    get,
    path = "/ws",
    tag = "events",
    params(
        ("token" = Option<String>, Query, description = "Shared token, when not sent in the Authorization header")
    ),
    responses(
        (status = 101, description = "Switching to WebSocket"),
        (status = 400, description = "Not a WebSocket upgrade request", body = ErrorBody),
        (status = 401, description = "Missing or wrong token", body = ErrorBody)
    )
)]
async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let query_token = raw_query
        .as_deref()
        .map(parse_urlencoded)
        .and_then(|mut params| params.remove(TOKEN_QUERY_PARAM));
    let token = presented_token(&headers, query_token.as_deref());

    // Refuse before the handshake so nothing reaches an unauthorized client.
    if !state.fanout.authorize(token.as_deref()) {
        return RouterError::Unauthorized.into_response();
    }

    let Some(ws) = ws else {
        return bad_request("Expected a WebSocket upgrade");
    };

    let fanout = state.fanout.clone();
    ws.on_upgrade(move |socket| async move {
        match fanout.connect(token.as_deref()) {
            Ok(subscription) => handle_socket(socket, fanout, subscription).await,
            Err(e) => warn!(error = %e, "Subscriber rejected after upgrade"),
        }
    })
}

async fn handle_socket(mut socket: WebSocket, fanout: Arc<FanOut>, subscription: Subscription) {
    let Subscription { id, mut receiver } = subscription;

    loop {
        tokio::select! {
            frame = receiver.recv() => {
                let Some(frame) = frame else { break };
                if socket.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    debug!(connection_id = %id, message = %text, "Subscriber message");
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    fanout.disconnect(&id);
}

// ============================================================================
// Health Endpoints
// ============================================================================

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = SimpleHealthResponse)
    )
)]
async fn health_handler(State(state): State<AppState>) -> Json<SimpleHealthResponse> {
    let status = if state.scheduler.is_accepting() { "UP" } else { "DRAINING" };

    Json(SimpleHealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Kubernetes liveness probe - returns 200 if the application is running
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is live", body = ProbeResponse)
    )
)]
async fn liveness_probe() -> Json<ProbeResponse> {
    Json(ProbeResponse { status: "LIVE".to_string() })
}

/// Kubernetes readiness probe - ready while the scheduler accepts work
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready", body = ProbeResponse),
        (status = 503, description = "Application is shutting down", body = ProbeResponse)
    )
)]
async fn readiness_probe(State(state): State<AppState>) -> Response {
    if state.scheduler.is_accepting() {
        (StatusCode::OK, Json(ProbeResponse { status: "READY".to_string() })).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(ProbeResponse { status: "NOT_READY".to_string() })).into_response()
    }
}

// ============================================================================
// Monitoring Endpoints
// ============================================================================

/// Prometheus metrics endpoint
#[utoipa::path(
    get,
    path = "/metrics",
    tag = "monitoring",
    responses(
        (status = 200, description = "Prometheus metrics", content_type = "text/plain"),
        (status = 503, description = "No metrics recorder installed")
    )
)]
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics recorder not installed\n".to_string(),
        )
            .into_response(),
    }
}

/// Scheduler and subscriber statistics
#[utoipa::path(
    get,
    path = "/monitoring",
    tag = "monitoring",
    responses(
        (status = 200, description = "Monitoring data", body = MonitoringResponse)
    )
)]
async fn monitoring_handler(State(state): State<AppState>) -> Json<MonitoringResponse> {
    let scheduler = state.scheduler.get_stats();
    let status = if scheduler.accepting { "HEALTHY" } else { "DRAINING" };

    Json(MonitoringResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        scheduler,
        subscribers: state.fanout.subscriber_count(),
    })
}
