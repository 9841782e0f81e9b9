use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::{AgentState, DataSource};

/// Lifecycle status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Initiated,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl WorkflowStatus {
    /// Terminal runs are never mutated again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed
                | WorkflowStatus::Failed
                | WorkflowStatus::Cancelled
                | WorkflowStatus::Timeout
        )
    }

    /// Agent state applied to every non-terminal agent when this status is
    /// forced onto a run from outside the aggregate
    pub fn override_agent_state(self) -> Option<AgentState> {
        match self {
            WorkflowStatus::Timeout => Some(AgentState::Timeout),
            WorkflowStatus::Cancelled | WorkflowStatus::Failed | WorkflowStatus::Completed => {
                Some(AgentState::Cancelled)
            }
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::Initiated => "initiated",
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Timeout => "timeout",
        };
        write!(f, "{}", name)
    }
}

/// Where a run's trigger came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    Api,
    Admin,
    Scheduled,
}

/// Aggregate counters recorded once a run reaches a terminal state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub completed: u32,
    pub failed: u32,
    pub timed_out: u32,
    pub cancelled: u32,
    pub total_retries: u32,
    pub duration_ms: i64,
}

/// One end-to-end execution spanning multiple agents
///
/// Created by the trigger gateway in `initiated`; afterwards only the state
/// tracker mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub correlation_id: String,
    pub session_id: String,
    pub trigger_source: TriggerSource,
    pub scope: String,
    pub context: serde_json::Value,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress_percent: f64,
    pub scheduled_agent_count: u32,
    /// How the platform trigger call was answered (live or cached)
    pub dispatch_source: Option<DataSource>,
    pub error_message: Option<String>,
    pub metrics: Option<WorkflowMetrics>,
}

/// Fresh id tying together every log line and response of one request
pub fn new_correlation_id() -> String {
    format!("corr-{}", Uuid::new_v4().simple())
}

impl WorkflowRun {
    pub fn new(
        session_id: impl Into<String>,
        scope: impl Into<String>,
        trigger_source: TriggerSource,
        context: serde_json::Value,
        scheduled_agent_count: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: new_correlation_id(),
            session_id: session_id.into(),
            trigger_source,
            scope: scope.into(),
            context,
            status: WorkflowStatus::Initiated,
            started_at: Utc::now(),
            completed_at: None,
            progress_percent: 0.0,
            scheduled_agent_count,
            dispatch_source: None,
            error_message: None,
            metrics: None,
        }
    }

    /// Keeps the id the caller already logged and returned for this request
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves the run into a terminal status, stamping `completed_at`
    pub fn finish(&mut self, status: WorkflowStatus, error: Option<String>) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        if error.is_some() {
            self.error_message = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_starts_initiated() {
        let run = WorkflowRun::new("session-1", "quick", TriggerSource::Api, serde_json::json!({}), 9);
        assert_eq!(run.status, WorkflowStatus::Initiated);
        assert_eq!(run.progress_percent, 0.0);
        assert!(run.correlation_id.starts_with("corr-"));
        assert!(!run.is_terminal());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Timeout.is_terminal());
        assert!(!WorkflowStatus::InProgress.is_terminal());
        assert_eq!(
            serde_json::to_value(WorkflowStatus::InProgress).unwrap(),
            serde_json::json!("in_progress")
        );
    }
}
