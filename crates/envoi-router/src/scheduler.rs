//! Forward Scheduler - bounded delivery queue drained by a fixed worker pool
//!
//! Each task walks `Pending -> InFlight -> {Delivered | Retrying -> InFlight | Exhausted}`.
//! Retries happen inside one loop per task with a fixed delay between
//! attempts. Tasks live in memory only and are lost on a crash.

use async_trait::async_trait;
use envoi_common::{Event, StreamId, Target};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::forwarder::Forwarder;
use crate::metrics;
use crate::{Result, RouterError};

/// One unit of forwarding work: an event bound to a single target.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub id: Uuid,
    pub route_id: String,
    /// Position of the event in the route log
    pub stream_id: StreamId,
    pub event: Arc<Event>,
    pub target: Target,
    /// Attempts started so far
    pub attempt: u32,
}

impl DeliveryTask {
    pub fn new(route_id: impl Into<String>, stream_id: StreamId, event: Arc<Event>, target: Target) -> Self {
        Self {
            id: Uuid::new_v4(),
            route_id: route_id.into(),
            stream_id,
            event,
            target,
            attempt: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    InFlight,
    Retrying,
    Delivered,
    Exhausted,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Delivered | DeliveryState::Exhausted)
    }
}

/// A state change of one task, reported to an optional observer.
#[derive(Debug, Clone)]
pub struct DeliveryTransition {
    pub task_id: Uuid,
    pub target: String,
    pub attempt: u32,
    pub state: DeliveryState,
    pub at: Instant,
}

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { status: u16, attempts: u32 },
    Exhausted { attempts: u32, last_error: DeliveryError },
}

/// Attempt budget and pacing for a task.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Fixed delay between attempts, no jitter
    pub backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            backoff: Duration::from_secs(3),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// Waits out the delay between attempts.
#[async_trait]
pub trait Backoff: Send + Sync {
    async fn wait(&self, delay: Duration);
}

/// Sleeps on the tokio timer.
pub struct SleepBackoff;

#[async_trait]
impl Backoff for SleepBackoff {
    async fn wait(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Accepts delivery tasks without waiting for them to run.
pub trait DeliverySink: Send + Sync {
    fn submit(&self, task: DeliveryTask) -> Result<()>;
}

type Observer = mpsc::UnboundedSender<DeliveryTransition>;

fn notify(observer: Option<&Observer>, task: &DeliveryTask, state: DeliveryState) {
    if let Some(tx) = observer {
        let _ = tx.send(DeliveryTransition {
            task_id: task.id,
            target: task.target.value.clone(),
            attempt: task.attempt,
            state,
            at: Instant::now(),
        });
    }
}

/// Drive one task to a terminal state.
pub async fn run_delivery(
    mut task: DeliveryTask,
    forwarder: &dyn Forwarder,
    policy: &RetryPolicy,
    backoff: &dyn Backoff,
    observer: Option<&Observer>,
) -> DeliveryOutcome {
    let started = Instant::now();
    notify(observer, &task, DeliveryState::Pending);

    loop {
        task.attempt += 1;
        notify(observer, &task, DeliveryState::InFlight);
        metrics::record_delivery_attempt();

        let result = match tokio::time::timeout(policy.attempt_timeout, forwarder.forward(&task)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::timeout(policy.attempt_timeout)),
        };

        let err = match result {
            Ok(response) => {
                if response.is_success() {
                    info!(
                        task_id = %task.id,
                        route = %task.route_id,
                        target = %task.target.value,
                        stream_id = %task.stream_id,
                        attempt = task.attempt,
                        status = response.status,
                        "Event delivered"
                    );
                } else {
                    warn!(
                        task_id = %task.id,
                        route = %task.route_id,
                        target = %task.target.value,
                        stream_id = %task.stream_id,
                        attempt = task.attempt,
                        status = response.status,
                        headers = ?response.headers,
                        body = %response.body,
                        "Target answered with a non-success status"
                    );
                }
                notify(observer, &task, DeliveryState::Delivered);
                metrics::record_delivery_outcome("delivered", started.elapsed());
                return DeliveryOutcome::Delivered {
                    status: response.status,
                    attempts: task.attempt,
                };
            }
            Err(err) => err,
        };

        if task.attempt >= policy.max_attempts {
            error!(
                task_id = %task.id,
                route = %task.route_id,
                target = %task.target.value,
                stream_id = %task.stream_id,
                attempts = task.attempt,
                kind = %err.kind,
                status = ?err.status,
                error = %err.message,
                "Delivery exhausted, dropping task"
            );
            notify(observer, &task, DeliveryState::Exhausted);
            metrics::record_delivery_outcome("exhausted", started.elapsed());
            return DeliveryOutcome::Exhausted {
                attempts: task.attempt,
                last_error: err,
            };
        }

        warn!(
            task_id = %task.id,
            target = %task.target.value,
            attempt = task.attempt,
            max_attempts = policy.max_attempts,
            kind = %err.kind,
            error = %err.message,
            "Delivery attempt failed, retrying"
        );
        notify(observer, &task, DeliveryState::Retrying);
        backoff.wait(policy.backoff).await;
    }
}

/// Configuration for the forward scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            queue_capacity: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    queued: AtomicU64,
    in_flight: AtomicU64,
    delivered: AtomicU64,
    exhausted: AtomicU64,
}

/// Scheduler statistics for monitoring
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub accepting: bool,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub queued: u64,
    pub in_flight: u64,
    pub delivered: u64,
    pub exhausted: u64,
}

/// Forward scheduler with a bounded queue and a fixed-size worker pool.
pub struct ForwardScheduler {
    config: SchedulerConfig,
    forwarder: Arc<dyn Forwarder>,
    backoff: Arc<dyn Backoff>,
    observer: Option<Observer>,

    sender: parking_lot::Mutex<Option<mpsc::Sender<DeliveryTask>>>,
    receiver: parking_lot::Mutex<Option<mpsc::Receiver<DeliveryTask>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,

    accepting: AtomicBool,
    counters: Arc<Counters>,
}

impl ForwardScheduler {
    pub fn new(config: SchedulerConfig, forwarder: Arc<dyn Forwarder>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));

        Self {
            config,
            forwarder,
            backoff: Arc::new(SleepBackoff),
            observer: None,
            sender: parking_lot::Mutex::new(Some(tx)),
            receiver: parking_lot::Mutex::new(Some(rx)),
            workers: parking_lot::Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Replace the delay step between attempts
    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Report every task state change on this channel
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<DeliveryTransition>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Spawn the worker pool. Calling it twice is a no-op.
    pub fn start(&self) {
        let Some(receiver) = self.receiver.lock().take() else {
            debug!("Forward scheduler already started");
            return;
        };
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let mut workers = self.workers.lock();
        for worker_id in 0..self.config.worker_count.max(1) {
            let receiver = receiver.clone();
            let forwarder = self.forwarder.clone();
            let backoff = self.backoff.clone();
            let observer = self.observer.clone();
            let policy = self.config.retry.clone();
            let counters = self.counters.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    let Some(task) = task else {
                        break;
                    };

                    counters.queued.fetch_sub(1, Ordering::SeqCst);
                    counters.in_flight.fetch_add(1, Ordering::SeqCst);

                    let outcome =
                        run_delivery(task, forwarder.as_ref(), &policy, backoff.as_ref(), observer.as_ref()).await;

                    counters.in_flight.fetch_sub(1, Ordering::SeqCst);
                    match outcome {
                        DeliveryOutcome::Delivered { .. } => counters.delivered.fetch_add(1, Ordering::SeqCst),
                        DeliveryOutcome::Exhausted { .. } => counters.exhausted.fetch_add(1, Ordering::SeqCst),
                    };
                }
                debug!(worker_id, "Delivery worker stopped");
            }));
        }

        info!(
            workers = self.config.worker_count,
            queue_capacity = self.config.queue_capacity,
            max_attempts = self.config.retry.max_attempts,
            backoff_ms = self.config.retry.backoff.as_millis() as u64,
            "Forward scheduler started"
        );
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// True once nothing is queued or in flight
    pub fn is_idle(&self) -> bool {
        self.counters.queued.load(Ordering::SeqCst) == 0 && self.counters.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Stop accepting tasks, let workers finish what is queued, then stop.
    ///
    /// Workers still busy after `grace` are aborted and their tasks lost.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        // Dropping the only sender closes the queue once it is drained.
        self.sender.lock().take();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }

        info!(
            queued = self.counters.queued.load(Ordering::SeqCst),
            in_flight = self.counters.in_flight.load(Ordering::SeqCst),
            grace_secs = grace.as_secs(),
            "Draining delivery workers"
        );

        let aborts: Vec<_> = workers.iter().map(|handle| handle.abort_handle()).collect();
        if tokio::time::timeout(grace, futures::future::join_all(workers)).await.is_err() {
            warn!(
                queued = self.counters.queued.load(Ordering::SeqCst),
                in_flight = self.counters.in_flight.load(Ordering::SeqCst),
                "Grace period elapsed, abandoning remaining deliveries"
            );
            for abort in aborts {
                abort.abort();
            }
        } else {
            info!("Delivery workers drained");
        }
    }

    pub fn get_stats(&self) -> SchedulerStats {
        SchedulerStats {
            accepting: self.is_accepting(),
            worker_count: self.config.worker_count,
            queue_capacity: self.config.queue_capacity,
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
            queued: self.counters.queued.load(Ordering::SeqCst),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            delivered: self.counters.delivered.load(Ordering::SeqCst),
            exhausted: self.counters.exhausted.load(Ordering::SeqCst),
        }
    }
}

impl DeliverySink for ForwardScheduler {
    fn submit(&self, task: DeliveryTask) -> Result<()> {
        if !self.is_accepting() {
            metrics::record_delivery_rejected("shutdown");
            return Err(RouterError::ShutdownInProgress);
        }

        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(RouterError::ShutdownInProgress)?;

        // Count before sending so a fast worker never decrements below zero.
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(task) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.counters.queued.fetch_sub(1, Ordering::SeqCst);
                self.counters.rejected.fetch_add(1, Ordering::SeqCst);
                match e {
                    TrySendError::Full(task) => {
                        warn!(task_id = %task.id, target = %task.target.value, "Delivery queue full, dropping task");
                        metrics::record_delivery_rejected("queue_full");
                        Err(RouterError::QueueFull)
                    }
                    TrySendError::Closed(_) => {
                        metrics::record_delivery_rejected("shutdown");
                        Err(RouterError::ShutdownInProgress)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 6);
        assert_eq!(policy.backoff, Duration::from_secs(3));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_terminal_states() {
        assert!(DeliveryState::Delivered.is_terminal());
        assert!(DeliveryState::Exhausted.is_terminal());
        assert!(!DeliveryState::Retrying.is_terminal());
        assert!(!DeliveryState::Pending.is_terminal());
    }
}
