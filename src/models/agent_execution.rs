use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{RelayError, Result};

/// Unique identifier for an agent within a workflow scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-agent lifecycle state
///
/// ```text
/// idle → starting → running → {completed, failed, timeout}
/// failed | timeout → retrying → starting
/// completed | failed | timeout | cancelled → archived
/// idle | starting | running | retrying → cancelled | timeout   (run-level override)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Timeout,
    Retrying,
    Cancelled,
    Archived,
}

impl AgentState {
    /// Whether `self → next` is an edge of the agent state machine
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Failed, Retrying)
                | (Timeout, Retrying)
                | (Retrying, Starting)
                | (Completed, Archived)
                | (Failed, Archived)
                | (Timeout, Archived)
                | (Cancelled, Archived)
        )
    }

    /// Edges only a run-level cancel or timeout may take
    pub fn can_be_overridden_to(self, next: AgentState) -> bool {
        self.is_active() && matches!(next, AgentState::Cancelled | AgentState::Timeout)
    }

    /// Settled: the agent will not progress without a retry or archival
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentState::Completed | AgentState::Failed | AgentState::Timeout | AgentState::Cancelled
        )
    }

    /// Still expected to produce events
    pub fn is_active(self) -> bool {
        matches!(
            self,
            AgentState::Idle | AgentState::Starting | AgentState::Running | AgentState::Retrying
        )
    }

    /// Shortest walk along event-driven edges from `self` to `target`
    ///
    /// Webhooks can arrive out of order, so an `agent_completed` seen while the
    /// agent is still `starting` walks `starting → running → completed`. Every
    /// step is a real edge; if none leads to `target` the event is rejected.
    pub fn path_to(self, target: AgentState) -> Option<Vec<AgentState>> {
        use AgentState::*;
        const FORWARD: [AgentState; 3] = [Idle, Starting, Running];

        if self.can_transition_to(target) {
            return Some(vec![target]);
        }
        // A retrying agent re-enters the forward walk at `starting`
        let from = match self {
            Retrying => 0,
            state => FORWARD.iter().position(|s| *s == state)?,
        };
        if !matches!(target, Running | Completed | Failed | Timeout) {
            return None;
        }
        let mut path: Vec<AgentState> = FORWARD[from + 1..].to_vec();
        if target != Running {
            path.push(target);
        }
        if path.is_empty() {
            return None;
        }
        Some(path)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Idle => "idle",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Completed => "completed",
            AgentState::Failed => "failed",
            AgentState::Timeout => "timeout",
            AgentState::Retrying => "retrying",
            AgentState::Cancelled => "cancelled",
            AgentState::Archived => "archived",
        };
        write!(f, "{}", name)
    }
}

/// Static description of an agent a scope schedules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub agent_id: AgentId,
    #[serde(default = "default_critical")]
    pub critical: bool,
    /// Overrides the tracker's default execution window
    #[serde(default)]
    pub max_execution_secs: Option<u64>,
}

fn default_critical() -> bool {
    true
}

impl AgentSpec {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            critical: true,
            max_execution_secs: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.critical = false;
        self
    }
}

/// One agent's execution record inside a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecution {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub agent_id: AgentId,
    pub state: AgentState,
    /// State held right before archival
    pub final_state: Option<AgentState>,
    pub critical: bool,
    pub max_execution_secs: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub result_payload: Option<serde_json::Value>,
    pub last_sequence_offset: Option<u64>,
    pub version: u64,
}

impl AgentExecution {
    pub fn new(workflow_run_id: Uuid, spec: &AgentSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_run_id,
            agent_id: spec.agent_id.clone(),
            state: AgentState::Idle,
            final_state: None,
            critical: spec.critical,
            max_execution_secs: spec.max_execution_secs,
            started_at: now,
            ended_at: None,
            last_updated_at: now,
            retry_count: 0,
            error_message: None,
            result_payload: None,
            last_sequence_offset: None,
            version: 0,
        }
    }

    /// Applies a single state-machine edge
    pub fn transition(&mut self, next: AgentState) -> Result<AgentState> {
        if !self.state.can_transition_to(next) {
            return Err(RelayError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        Ok(self.apply(next))
    }

    /// Applies a run-level cancel/timeout override
    pub fn force(&mut self, next: AgentState) -> Result<AgentState> {
        if !self.state.can_be_overridden_to(next) {
            return Err(RelayError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        Ok(self.apply(next))
    }

    /// Settles an agent whose retry budget is spent as `failed`
    ///
    /// Returns `true` if the state changed; the error message is kept.
    pub fn exhaust_retries(&mut self) -> bool {
        match self.state {
            AgentState::Timeout => {
                self.apply(AgentState::Failed);
                true
            }
            _ => false,
        }
    }

    fn apply(&mut self, next: AgentState) -> AgentState {
        let previous = self.state;
        let now = Utc::now();
        match next {
            AgentState::Starting => {
                self.started_at = now;
                self.ended_at = None;
            }
            AgentState::Retrying => {
                self.retry_count += 1;
                self.error_message = None;
            }
            AgentState::Archived => self.final_state = Some(previous),
            state if state.is_terminal() => self.ended_at = Some(now),
            _ => {}
        }
        self.state = next;
        self.last_updated_at = now;
        self.version += 1;
        previous
    }

    /// Counts as a failure for failure-policy purposes
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome(), AgentState::Failed | AgentState::Timeout)
    }

    /// State used for aggregation; archived agents report their final state
    pub fn outcome(&self) -> AgentState {
        match self.state {
            AgentState::Archived => self.final_state.unwrap_or(AgentState::Archived),
            state => state,
        }
    }
}
