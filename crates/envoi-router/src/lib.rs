//! Envoi Webhook Router
//!
//! This crate provides the ingestion, routing and forwarding pipeline:
//! - RouteRegistry: exact-match lookup of route paths to their targets
//! - EventLog: append-only per-route record of received events
//! - ForwardScheduler: bounded delivery queue with a worker pool and fixed-delay retry
//! - HttpForwarder: a single HTTP delivery attempt against a target
//! - FanOut: live notifications to WebSocket subscribers
//! - Dispatcher: ties the above together for each inbound request
//! - API: HTTP endpoints for ingestion, history, live feed, health and metrics

pub mod error;
pub mod registry;
pub mod event_log;
pub mod forwarder;
pub mod scheduler;
pub mod fanout;
pub mod dispatcher;
pub mod metrics;
pub mod api;

pub use error::{DeliveryError, DeliveryErrorKind, RouterError};
pub use registry::{InMemoryRouteRegistry, RedisRouteRegistry, RouteRegistry};
pub use event_log::{EventLog, InMemoryEventLog, RangeBound, RedisEventLog};
pub use forwarder::{ForwardResponse, Forwarder, HttpForwarder, HttpForwarderConfig};
pub use scheduler::{
    run_delivery, Backoff, DeliveryOutcome, DeliverySink, DeliveryState, DeliveryTask,
    DeliveryTransition, ForwardScheduler, RetryPolicy, SchedulerConfig, SchedulerStats, SleepBackoff,
};
pub use fanout::{Broadcaster, ConnectionId, FanOut, Subscription};
pub use dispatcher::{DispatchOutcome, Dispatcher, InboundRequest};
pub use api::{create_router, ApiDoc, AppState};

pub type Result<T> = std::result::Result<T, RouterError>;
