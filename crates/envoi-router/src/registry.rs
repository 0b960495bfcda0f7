//! Route Registry - keyed lookup from route path to targets
//!
//! Routes are owned by the admin surface; the router only reads them.
//! - `InMemoryRouteRegistry`: process-local map, seeded from config or tests
//! - `RedisRouteRegistry`: reads the `url:<path>` hashes written by the admin API

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use envoi_common::{normalize_path, Route, Target};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::debug;

use crate::{Result, RouterError};

/// Default key prefix for route hashes
pub const ROUTE_KEY_PREFIX: &str = "url:";

/// Read side of the route store.
///
/// Lookups are exact matches on the normalized path, no wildcards.
#[async_trait]
pub trait RouteRegistry: Send + Sync {
    async fn lookup(&self, path: &str) -> Result<Option<Route>>;
}

/// Route registry held in process memory.
#[derive(Default)]
pub struct InMemoryRouteRegistry {
    routes: DashMap<String, Route>,
}

impl InMemoryRouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routes(routes: impl IntoIterator<Item = Route>) -> Self {
        let registry = Self::new();
        for route in routes {
            registry.upsert(route);
        }
        registry
    }

    /// Insert or replace a route, keyed by its normalized path
    pub fn upsert(&self, mut route: Route) -> Option<Route> {
        route.path = normalize_path(&route.path).to_string();
        self.routes.insert(route.path.clone(), route)
    }

    pub fn remove(&self, path: &str) -> Option<Route> {
        self.routes.remove(normalize_path(path)).map(|(_, route)| route)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl RouteRegistry for InMemoryRouteRegistry {
    async fn lookup(&self, path: &str) -> Result<Option<Route>> {
        Ok(self.routes.get(path).map(|entry| entry.value().clone()))
    }
}

/// Route registry backed by Redis hashes.
pub struct RedisRouteRegistry {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisRouteRegistry {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: ROUTE_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, path: &str) -> String {
        format!("{}{}", self.key_prefix, path)
    }
}

#[async_trait]
impl RouteRegistry for RedisRouteRegistry {
    async fn lookup(&self, path: &str) -> Result<Option<Route>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.key(path)).await?;

        if fields.is_empty() {
            debug!(path = %path, "Route not registered");
            return Ok(None);
        }

        route_from_hash(path, &fields).map(Some)
    }
}

/// Decode the hash layout `{path, targets: JSON, tags: JSON, created}`.
///
/// Older entries store the path under `url`; missing path fields fall back
/// to the lookup key.
fn route_from_hash(path: &str, fields: &HashMap<String, String>) -> Result<Route> {
    let stored_path = fields
        .get("path")
        .or_else(|| fields.get("url"))
        .map(|p| normalize_path(p).to_string())
        .unwrap_or_else(|| path.to_string());

    let targets: Vec<Target> = match fields.get("targets") {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| RouterError::Storage(format!("route {} has invalid targets: {}", path, e)))?,
        None => Vec::new(),
    };

    let tags: Vec<String> = match fields.get("tags") {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| RouterError::Storage(format!("route {} has invalid tags: {}", path, e)))?,
        None => Vec::new(),
    };

    let created = fields
        .get("created")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Ok(Route {
        path: stored_path,
        targets,
        tags,
        created,
    })
}
