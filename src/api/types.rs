// Request and response bodies of the relay HTTP API
// Error bodies share one shape: {"error": {"type", "message", "correlationId"}}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};
use uuid::Uuid;

use crate::models::{WorkflowRun, WorkflowStatus};
use crate::RelayError;

/// Body of `202 Accepted` for a new run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub workflow_run_id: Uuid,
    pub correlation_id: String,
    pub session_id: String,
    pub status: WorkflowStatus,
    pub scheduled_agents: u32,
    pub poll_url: String,
    pub events_url: String,
}

impl From<&WorkflowRun> for TriggerResponse {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            workflow_run_id: run.id,
            correlation_id: run.correlation_id.clone(),
            session_id: run.session_id.clone(),
            status: run.status,
            scheduled_agents: run.scheduled_agent_count,
            poll_url: format!("/api/v1/workflows/{}/status", run.id),
            events_url: format!("/api/v1/workflows/{}/events", run.id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub workflow_run_id: Uuid,
    pub status: WorkflowStatus,
    pub progress_percent: f64,
}

/// `?after=N` on the event stream; `Last-Event-ID` wins when both are sent
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub after: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerResetResponse {
    pub endpoint: String,
    pub reset: bool,
}

/// Error returned by every handler
#[derive(Debug)]
pub struct ApiError {
    pub error: RelayError,
    pub correlation_id: Option<String>,
}

impl ApiError {
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

impl From<RelayError> for ApiError {
    fn from(error: RelayError) -> Self {
        Self {
            error,
            correlation_id: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(kind = self.error.kind(), correlation_id = ?self.correlation_id, "❌ {}", self.error);
        } else {
            warn!(kind = self.error.kind(), correlation_id = ?self.correlation_id, "{}", self.error);
        }

        let mut body = json!({
            "error": {
                "type": self.error.kind(),
                "message": self.error.to_string(),
                "correlationId": self.correlation_id,
            }
        });
        match &self.error {
            RelayError::ConcurrentTrigger { active_run_id, .. } => {
                body["error"]["activeRunId"] = json!(active_run_id);
            }
            RelayError::RateLimited {
                retry_after: Some(retry_after),
                ..
            } => {
                body["error"]["retryAfterSecs"] = json!(retry_after.as_secs());
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_body_carries_type_and_status() {
        let active = Uuid::new_v4();
        let response = ApiError::from(RelayError::ConcurrentTrigger {
            session_id: "s1".into(),
            active_run_id: active,
        })
        .with_correlation("corr-9")
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "concurrent_trigger_error");
        assert_eq!(body["error"]["correlationId"], "corr-9");
        assert_eq!(body["error"]["activeRunId"], json!(active));
    }

    #[test]
    fn test_trigger_response_links_to_run() {
        let run = WorkflowRun::new(
            "s1".to_string(),
            "quick".to_string(),
            Default::default(),
            serde_json::Value::Null,
            9,
        );
        let response = TriggerResponse::from(&run);
        assert_eq!(response.poll_url, format!("/api/v1/workflows/{}/status", run.id));
        assert_eq!(response.scheduled_agents, 9);
    }
}
