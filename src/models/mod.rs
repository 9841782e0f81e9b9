// Core domain models for Agent Relay
// Plain data structures shared by the engines and the HTTP layer

//! # Domain Models Module
//!
//! The five persisted entities (workflow runs, agent executions, webhook
//! events, breaker records, fallback records) plus the value types that flow
//! between engines: stream events, status snapshots and webhook acks.
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a clean, flat API.
//! Users can import `use agent_relay::models::WorkflowRun` instead of
//! `use agent_relay::models::workflow_run::WorkflowRun`.

// WorkflowRun and its status enum
pub mod workflow_run;

// AgentExecution, AgentState machine and AgentSpec
pub mod agent_execution;

// Webhook envelope, tagged event union, audit record and ack
pub mod webhook;

// Circuit breaker record
pub mod breaker;

// Fallback cache record
pub mod fallback;

// Event stream entries
pub mod stream;

// Status query response
pub mod status;

pub use agent_execution::{AgentExecution, AgentId, AgentSpec, AgentState};
pub use breaker::{BreakerPhase, CircuitBreakerState};
pub use fallback::{DataSource, FallbackRecord};
pub use status::{AgentStatusView, StatusSnapshot};
pub use stream::{StateChange, StateChangeEvent};
pub use webhook::{AckOutcome, AckResponse, IncomingEvent, WebhookEnvelope, WebhookEvent};
pub use workflow_run::{
    new_correlation_id, TriggerSource, WorkflowMetrics, WorkflowRun, WorkflowStatus,
};
