use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::scheduler::SchedulerStats;

/// Acknowledgement returned once a webhook has been accepted
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    /// Always `ok`
    pub message: String,
}

impl MessageResponse {
    pub fn ok() -> Self {
        Self {
            message: "ok".to_string(),
        }
    }
}

/// Query parameters for the event history endpoint
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    /// Route path, with or without a leading slash
    pub path: String,
    /// Oldest id to include (`-` for the start of the log)
    pub from: Option<String>,
    /// Newest id to include (`+` for the end of the log)
    pub to: Option<String>,
    /// Maximum number of entries returned
    pub limit: Option<usize>,
    /// Shared token, when not sent in the Authorization header
    pub token: Option<String>,
}

/// Simple health response for basic health check
#[derive(Serialize, ToSchema)]
pub struct SimpleHealthResponse {
    /// Health status: UP, DRAINING
    pub status: String,
    /// Application version
    pub version: String,
}

/// Kubernetes probe response
#[derive(Serialize, ToSchema)]
pub struct ProbeResponse {
    /// Probe status: LIVE, READY, NOT_READY
    pub status: String,
}

/// Detailed monitoring response
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringResponse {
    /// Overall status: HEALTHY, DRAINING
    pub status: String,
    pub version: String,
    pub scheduler: SchedulerStats,
    /// Connected live subscribers
    pub subscribers: usize,
}
