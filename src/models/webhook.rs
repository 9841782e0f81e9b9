use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::AgentId;
use crate::{RelayError, Result};

/// Raw webhook body as sent by the agent platform
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    pub event_type: String,
    #[serde(default)]
    pub workflow_run_id: Option<Uuid>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub sequence_offset: u64,
    #[serde(default)]
    pub payload: Value,
}

impl WebhookEnvelope {
    /// Content-derived key identifying one logical event
    ///
    /// `serde_json::Value` objects serialize with sorted keys, so the hash is
    /// stable across senders that reorder fields or change whitespace.
    pub fn dedup_hash(&self) -> String {
        let canonical = json!({
            "eventType": self.event_type,
            "workflowRunId": self.workflow_run_id,
            "agentId": self.agent_id,
            "sequenceOffset": self.sequence_offset,
            "payload": self.payload,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Interpreted webhook, one variant per known `eventType`
///
/// Unknown types are kept as [`IncomingEvent::Unknown`] so they can be
/// persisted and acknowledged without being applied.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingEvent {
    AgentStarted {
        workflow_run_id: Uuid,
        agent_id: AgentId,
    },
    AgentCompleted {
        workflow_run_id: Uuid,
        agent_id: AgentId,
        result: Value,
    },
    AgentFailed {
        workflow_run_id: Uuid,
        agent_id: AgentId,
        error: String,
    },
    WorkflowCompleted {
        workflow_run_id: Uuid,
    },
    WorkflowFailed {
        workflow_run_id: Uuid,
        error: String,
    },
    DataReceived {
        workflow_run_id: Uuid,
        agent_id: Option<AgentId>,
        data: Value,
    },
    Unknown {
        event_type: String,
    },
}

impl IncomingEvent {
    pub fn from_envelope(envelope: &WebhookEnvelope) -> Result<Self> {
        let run_id = || {
            envelope.workflow_run_id.ok_or_else(|| {
                RelayError::Validation(format!("{} requires workflowRunId", envelope.event_type))
            })
        };
        let agent_id = || {
            envelope
                .agent_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .map(AgentId::from)
                .ok_or_else(|| {
                    RelayError::Validation(format!("{} requires agentId", envelope.event_type))
                })
        };
        let error_text = || {
            envelope
                .payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("agent reported failure")
                .to_string()
        };

        let event = match envelope.event_type.as_str() {
            "agent_started" => IncomingEvent::AgentStarted {
                workflow_run_id: run_id()?,
                agent_id: agent_id()?,
            },
            "agent_completed" => IncomingEvent::AgentCompleted {
                workflow_run_id: run_id()?,
                agent_id: agent_id()?,
                result: envelope.payload.clone(),
            },
            "agent_failed" => IncomingEvent::AgentFailed {
                workflow_run_id: run_id()?,
                agent_id: agent_id()?,
                error: error_text(),
            },
            "workflow_completed" => IncomingEvent::WorkflowCompleted {
                workflow_run_id: run_id()?,
            },
            "workflow_failed" => IncomingEvent::WorkflowFailed {
                workflow_run_id: run_id()?,
                error: error_text(),
            },
            "data_received" => IncomingEvent::DataReceived {
                workflow_run_id: run_id()?,
                agent_id: envelope.agent_id.as_deref().map(AgentId::from),
                data: envelope.payload.clone(),
            },
            other => IncomingEvent::Unknown {
                event_type: other.to_string(),
            },
        };
        Ok(event)
    }
}

/// What the pipeline did with a delivery; part of the ack body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Applied,
    /// Accepted but did not change state (stale, out-of-order or terminal run)
    Ignored,
    /// Unknown event type, persisted only
    Unrecognized,
}

/// Body returned to the platform for an accepted webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub ack: bool,
    pub event_id: Uuid,
    pub outcome: AckOutcome,
}

/// Append-only audit record of one webhook delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub id: Uuid,
    pub workflow_run_id: Option<Uuid>,
    pub agent_id: Option<AgentId>,
    pub event_type: Option<String>,
    pub sequence_offset: u64,
    pub dedup_hash: String,
    pub signature_valid: bool,
    pub received_at: DateTime<Utc>,
    pub processing_time_ms: u64,
    pub http_status: u16,
    pub outcome: Option<AckOutcome>,
    /// Set when this delivery repeated an already-processed event
    pub duplicate_of: Option<Uuid>,
}

impl WebhookEvent {
    /// Ack originally returned for this event, if it was accepted
    pub fn ack(&self) -> Option<AckResponse> {
        self.outcome.map(|outcome| AckResponse {
            ack: true,
            event_id: self.id,
            outcome,
        })
    }
}
