use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    /// The request path does not carry the ingestion prefix. The route layer
    /// mounted the ingest handler somewhere it should not be.
    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Path {0} not found")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("You are not authorized")]
    Unauthorized,

    #[error("Delivery queue is full")]
    QueueFull,

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// How a single delivery attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryErrorKind {
    Timeout,
    Connect,
    Request,
}

impl fmt::Display for DeliveryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryErrorKind::Timeout => write!(f, "timeout"),
            DeliveryErrorKind::Connect => write!(f, "connect"),
            DeliveryErrorKind::Request => write!(f, "request"),
        }
    }
}

/// Failure of one delivery attempt. Retried by the scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct DeliveryError {
    pub kind: DeliveryErrorKind,
    pub message: String,
    /// Upstream status, when the transport got far enough to see one
    pub status: Option<u16>,
}

impl DeliveryError {
    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: DeliveryErrorKind::Timeout,
            message: format!("no response within {}ms", after.as_millis()),
            status: None,
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self {
            kind: DeliveryErrorKind::Connect,
            message: message.into(),
            status: None,
        }
    }

    pub fn request(message: impl Into<String>) -> Self {
        Self {
            kind: DeliveryErrorKind::Request,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        let error = if e.is_timeout() {
            DeliveryError {
                kind: DeliveryErrorKind::Timeout,
                message: e.to_string(),
                status: None,
            }
        } else if e.is_connect() {
            DeliveryError::connect(e.to_string())
        } else {
            DeliveryError::request(e.to_string())
        };

        match e.status() {
            Some(status) => error.with_status(status.as_u16()),
            None => error,
        }
    }
}
