//! Envoi Webhook Router Server
//!
//! Receives webhooks under the ingestion prefix, records them per route and
//! relays them to each configured target. Serves the event history, the live
//! WebSocket feed and the monitoring endpoints on the same port.
//!
//! ## Storage
//!
//! - `storage = "redis"` (default): routes are read from `url:<path>` hashes
//!   and events appended to `stream:url:<path>` streams.
//! - `storage = "memory"`: routes come from the `[[routes]]` config entries
//!   and events are lost on restart.

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use envoi_common::{Route, Target};
use envoi_config::{AppConfig, ConfigLoader, StorageBackend};
use envoi_router::{
    api::create_router, AppState, Dispatcher, EventLog, FanOut, ForwardScheduler, HttpForwarder,
    HttpForwarderConfig, InMemoryEventLog, InMemoryRouteRegistry, RedisEventLog, RedisRouteRegistry,
    RetryPolicy, RouteRegistry, SchedulerConfig,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::{net::TcpListener, signal, sync::oneshot};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    envoi_common::logging::init_logging("envoi-server");

    info!("Starting Envoi Webhook Router");

    // 1. Configuration
    let config = ConfigLoader::new().load().context("Failed to load configuration")?;

    // 2. Metrics recorder
    let prometheus = install_metrics_recorder();

    // 3. Storage
    let (registry, event_log) = build_storage(&config).await?;

    // 4. Delivery
    let forwarder = HttpForwarder::new(HttpForwarderConfig {
        connect_timeout: config.delivery.connect_timeout(),
        ..Default::default()
    })
    .context("Failed to build HTTP forwarder")?;

    let scheduler = Arc::new(ForwardScheduler::new(
        SchedulerConfig {
            worker_count: config.delivery.worker_count,
            queue_capacity: config.delivery.queue_capacity,
            retry: RetryPolicy {
                max_attempts: config.delivery.max_attempts,
                backoff: config.delivery.backoff(),
                attempt_timeout: config.delivery.attempt_timeout(),
            },
        },
        Arc::new(forwarder),
    ));
    scheduler.start();

    // 5. Live fan-out and dispatcher
    let fanout = Arc::new(FanOut::new(config.auth.api_token.clone()));
    let dispatcher = Arc::new(
        Dispatcher::new(registry, event_log.clone(), scheduler.clone(), fanout.clone())
            .with_prefix(config.ingest.prefix.clone())
            .with_retention(config.event_log.retention()),
    );

    // 6. HTTP API
    let app = create_router(AppState {
        dispatcher,
        event_log,
        fanout,
        scheduler: scheduler.clone(),
        history_limit: config.event_log.history_limit,
        prometheus,
    })
    .layer(TraceLayer::new_for_http())
    .layer(cors_layer(&config.http.cors_origins));

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(address = %addr, "Starting HTTP API server");

    let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        let shutdown = async {
            let _ = http_shutdown_rx.await;
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            error!(error = %e, "HTTP server error");
        }
    });

    log_startup_summary(&config);

    info!("Envoi started. Press Ctrl+C to shutdown.");

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received...");

    // Drain deliveries first, then stop accepting connections.
    scheduler.shutdown(config.delivery.shutdown_grace()).await;

    let _ = http_shutdown_tx.send(());
    if let Err(e) = server_task.await {
        warn!(error = %e, "HTTP server task ended abnormally");
    }

    info!("Envoi shutdown complete");
    Ok(())
}

fn install_metrics_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
            None
        }
    }
}

async fn build_storage(config: &AppConfig) -> Result<(Arc<dyn RouteRegistry>, Arc<dyn EventLog>)> {
    match config.storage {
        StorageBackend::Redis => {
            let client = redis::Client::open(config.redis.url.as_str())
                .with_context(|| format!("Invalid Redis URL {}", config.redis.url))?;
            let conn = ConnectionManager::new(client)
                .await
                .context("Failed to connect to Redis")?;
            info!(url = %config.redis.url, "Connected to Redis");

            if !config.routes.is_empty() {
                warn!(
                    routes = config.routes.len(),
                    "Ignoring [[routes]] entries, routes are read from Redis"
                );
            }

            Ok((
                Arc::new(RedisRouteRegistry::new(conn.clone())),
                Arc::new(RedisEventLog::new(conn)),
            ))
        }
        StorageBackend::Memory => {
            let routes = config.routes.iter().map(|seed| {
                Route::new(&seed.path, seed.targets.iter().map(Target::new).collect()).with_tags(seed.tags.clone())
            });
            let registry = InMemoryRouteRegistry::with_routes(routes);
            info!(routes = registry.len(), "Using in-memory storage");

            Ok((Arc::new(registry), Arc::new(InMemoryEventLog::new())))
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Skipping invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

fn log_startup_summary(config: &AppConfig) {
    info!("==========================================");
    info!("Envoi Webhook Router");
    info!("  Ingest: {}/<route>", config.ingest.prefix);
    info!("  Storage: {:?}", config.storage);
    info!(
        "  Delivery: {} workers, {} attempts, {}ms backoff, {}ms timeout",
        config.delivery.worker_count,
        config.delivery.max_attempts,
        config.delivery.backoff_ms,
        config.delivery.attempt_timeout_ms
    );
    info!("  Event retention: {}s", config.event_log.retention_secs);
    info!("==========================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
