//! Forwarder - one HTTP delivery attempt to a target
//!
//! The forwarder never retries on its own; the scheduler owns the retry loop.

use async_trait::async_trait;
use reqwest::{Client, Method};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::DeliveryError;
use crate::scheduler::DeliveryTask;

/// Longest response body kept for logging
const MAX_LOGGED_BODY: usize = 2048;

/// What the target answered. Any completed HTTP exchange lands here,
/// whatever the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Response body, truncated for logging
    pub body: String,
}

impl ForwardResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs a single delivery attempt.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, task: &DeliveryTask) -> std::result::Result<ForwardResponse, DeliveryError>;
}

/// Configuration for the HTTP forwarder
#[derive(Debug, Clone)]
pub struct HttpForwarderConfig {
    pub connect_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpForwarderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            pool_max_idle_per_host: 10,
        }
    }
}

/// Replays the captured request against the target: same method, the
/// original body as JSON and the original query string.
pub struct HttpForwarder {
    client: Client,
}

impl HttpForwarder {
    pub fn new(config: HttpForwarderConfig) -> std::result::Result<Self, DeliveryError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| DeliveryError::request(format!("failed to build HTTP client: {}", e)))?;

        info!(
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            "HttpForwarder initialized"
        );

        Ok(Self { client })
    }

    /// Build a forwarder around an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_LOGGED_BODY {
        let mut cut = MAX_LOGGED_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    body
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, task: &DeliveryTask) -> std::result::Result<ForwardResponse, DeliveryError> {
        let event = &task.event;
        let method = Method::from_bytes(event.method.to_uppercase().as_bytes())
            .map_err(|e| DeliveryError::request(format!("invalid method {}: {}", event.method, e)))?;

        debug!(
            task_id = %task.id,
            target = %task.target.value,
            method = %method,
            attempt = task.attempt,
            "Forwarding event"
        );

        let request = self
            .client
            .request(method, &task.target.value)
            .query(&event.query_string)
            .json(&event.body);

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        // A body cut short is a transport failure, not a completed exchange.
        let body = response
            .text()
            .await
            .map_err(|e| DeliveryError::from(e).with_status(status))?;
        let body = truncate(body);

        Ok(ForwardResponse { status, headers, body })
    }
}
