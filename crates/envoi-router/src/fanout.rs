//! Live Fan-out - pushes new-event notifications to connected subscribers
//!
//! Every subscriber owns a bounded channel; the socket task on the other
//! end drains it. A broadcast serializes once and clones the text into each
//! channel, dropping subscribers whose receiving end has gone away or whose
//! queue is full.

use dashmap::DashMap;
use envoi_common::Notification;
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::{Result, RouterError};

/// Handle identifying one subscriber connection
pub type ConnectionId = Uuid;

/// Frames a subscriber may have queued before it is dropped
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Publishes notifications to live subscribers.
pub trait Broadcaster: Send + Sync {
    /// Push to every open connection and return how many were reached.
    fn broadcast(&self, notification: &Notification) -> usize;
}

/// An accepted subscriber: its id and the frames destined for it.
pub struct Subscription {
    pub id: ConnectionId,
    pub receiver: mpsc::Receiver<Arc<str>>,
}

/// Process-wide set of live subscribers guarded by a shared token.
pub struct FanOut {
    token: String,
    subscribers: DashMap<ConnectionId, mpsc::Sender<Arc<str>>>,
    buffer: usize,
}

/// Compare a presented token with the configured secret in constant time.
///
/// An empty configured secret matches nothing.
pub fn token_matches(expected: &str, presented: Option<&str>) -> bool {
    match presented {
        Some(candidate) if !expected.is_empty() => {
            bool::from(expected.as_bytes().ct_eq(candidate.as_bytes()))
        }
        _ => false,
    }
}

impl FanOut {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            subscribers: DashMap::new(),
            buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }

    /// Set how many frames a slow subscriber may fall behind by
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn authorize(&self, presented: Option<&str>) -> bool {
        token_matches(&self.token, presented)
    }

    /// Register a subscriber. The first frame it receives is its greeting.
    pub fn connect(&self, presented: Option<&str>) -> Result<Subscription> {
        if !self.authorize(presented) {
            debug!("Rejected subscriber with invalid token");
            return Err(RouterError::Unauthorized);
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);

        let greeting = json!({ "message": format!("Your ID is {}", id) }).to_string();
        // Fresh channel with capacity of at least one.
        let _ = tx.try_send(Arc::from(greeting));

        self.subscribers.insert(id, tx);
        let count = self.subscribers.len();
        metrics::set_subscribers(count);
        info!(connection_id = %id, subscribers = count, "Subscriber connected");

        Ok(Subscription { id, receiver: rx })
    }

    /// Remove a subscriber. Removing an unknown id does nothing.
    pub fn disconnect(&self, id: &ConnectionId) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            let count = self.subscribers.len();
            metrics::set_subscribers(count);
            info!(connection_id = %id, subscribers = count, "Subscriber disconnected");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Broadcaster for FanOut {
    fn broadcast(&self, notification: &Notification) -> usize {
        let payload: Arc<str> = match serde_json::to_string(notification) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                warn!(route = %notification.route(), error = %e, "Failed to serialize notification");
                return 0;
            }
        };

        let mut reached = 0;
        self.subscribers.retain(|id, tx| match tx.try_send(payload.clone()) {
            Ok(()) => {
                reached += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %id, buffer = self.buffer, "Dropping subscriber that fell behind");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %id, "Dropping closed subscriber");
                false
            }
        });

        metrics::record_broadcast(reached);
        metrics::set_subscribers(self.subscribers.len());
        debug!(route = %notification.route(), reached, "Broadcast notification");
        reached
    }
}
