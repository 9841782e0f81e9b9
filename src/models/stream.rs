use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AgentId, AgentState, WorkflowStatus};

/// What changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateChange {
    AgentTransitioned {
        agent_id: AgentId,
        from: AgentState,
        to: AgentState,
        retry_count: u32,
    },
    WorkflowStatusChanged {
        from: WorkflowStatus,
        to: WorkflowStatus,
        progress_percent: f64,
    },
    ProgressUpdated {
        progress_percent: f64,
    },
    DataReceived {
        agent_id: Option<AgentId>,
        data: serde_json::Value,
    },
}

/// One entry of a run's append-only event stream
///
/// `sequence` is strictly increasing per run, starting at 1. Delivery is
/// at-least-once; subscribers drop anything at or below the last sequence
/// they have seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub sequence: u64,
    pub workflow_run_id: Uuid,
    pub change: StateChange,
    pub occurred_at: DateTime<Utc>,
}
