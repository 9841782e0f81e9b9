use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AgentExecution, AgentId, AgentState, WorkflowStatus};

/// Per-agent line of a status snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusView {
    pub agent_id: AgentId,
    pub state: AgentState,
    /// Final state for archived agents, otherwise the current state
    pub outcome: AgentState,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

impl From<&AgentExecution> for AgentStatusView {
    fn from(execution: &AgentExecution) -> Self {
        Self {
            agent_id: execution.agent_id.clone(),
            state: execution.state,
            outcome: execution.outcome(),
            retry_count: execution.retry_count,
            error_message: execution.error_message.clone(),
        }
    }
}

/// Response of the status query
///
/// `stale` marks a snapshot served from cache because the live store was
/// unreachable; `fallback` marks cached results served for a run that did
/// not finish live. Neither flag set means live data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub workflow_run_id: Uuid,
    pub correlation_id: String,
    pub status: WorkflowStatus,
    pub progress_percent: f64,
    pub agents: Vec<AgentStatusView>,
    pub should_continue_polling: bool,
    pub next_poll_interval_ms: u64,
    pub poll_attempt: u32,
    pub stale: bool,
    pub fallback: bool,
    pub fallback_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
}
