// Agent Relay - Rust Edition
// Coordinates externally-run agent workflows, ingests their webhooks and
// invokes the agent platform behind retry, circuit breaker and fallback policies

//! # Agent Relay Library
//!
//! This is the main library crate for Agent Relay. A single user action
//! triggers a **workflow run** on an external agent platform; the platform
//! reports progress back through signed, possibly duplicated and out-of-order
//! webhooks. This crate owns everything between those two edges.
//!
//! ## Core Components
//!
//! ### Domain Models (`models`)
//! - [`WorkflowRun`]: one end-to-end execution, from trigger to terminal state
//! - [`AgentExecution`]: one agent's progress inside a run, driven by a state machine
//! - [`WebhookEvent`]: append-only audit record of every webhook delivery
//! - [`CircuitBreakerState`] / [`FallbackRecord`]: reliability bookkeeping
//!
//! ### Engine (`engine`)
//! - [`CircuitBreakerRegistry`]: keyed breaker table shared by every outbound call
//! - [`ReliabilityInvoker`]: breaker + retry + fallback + alerting behind one call
//! - [`TriggerGateway`]: single-in-flight-per-session trigger entry point
//! - [`WebhookPipeline`]: authenticate, deduplicate, persist and apply webhooks
//! - [`StateTracker`]: agent/workflow state machines and progress aggregation
//! - [`EventStreamPublisher`] / [`StatusQuery`]: consumer-facing views
//!
//! ### HTTP Surface (`api`, `server`)
//! Axum routes for trigger, status, cancel, event streaming and webhook
//! intake, assembled by [`RelayServerBuilder`].
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the internal
//! module structure. Instead of `use agent_relay::engine::gateway::TriggerGateway`,
//! users can write `use agent_relay::TriggerGateway`.

// Core domain models
pub mod models;

// Reliability, ingestion and state tracking engines
pub mod engine;

// HTTP handlers and request/response types
pub mod api;

// Server assembly (wires config, engines and router together)
pub mod server;

// Layered configuration (file + environment)
pub mod config;

pub use models::{
    AckResponse, AgentExecution, AgentId, AgentState, BreakerPhase, CircuitBreakerState,
    FallbackRecord, StateChange, StateChangeEvent, StatusSnapshot, TriggerSource,
    WebhookEnvelope, WebhookEvent, WorkflowRun, WorkflowStatus,
};

pub use engine::{
    alerts::{Alert, AlertSink, BroadcastAlertSink, TracingAlertSink},
    breaker::{BreakerConfig, CircuitBreakerRegistry},
    gateway::{TriggerGateway, TriggerRequest},
    invoker::{CallMeta, ExternalEndpoint, InvocationResult, ReliabilityConfig, ReliabilityInvoker},
    retry::{BackoffStrategy, CallError, RetryPolicy},
    status::{PollingPolicy, StatusQuery},
    storage::{InMemoryStorage, RelayStorage},
    stream::{EventStreamPublisher, SequenceDedup},
    tracker::{FailurePolicy, StateTracker, TrackerConfig},
    webhooks::{SignatureVerifier, WebhookHeaders, WebhookPipeline},
};

pub use config::RelayConfig;
pub use server::{RelayServer, RelayServerBuilder};

use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy for Agent Relay operations
///
/// Every failure a caller can observe maps to exactly one variant. The HTTP
/// layer turns them into status codes through [`RelayError::status_code`],
/// and the reliability layer asks [`RelayError::is_retryable`] before
/// spending retry budget.
///
/// ## Rust Learning Notes:
///
/// ### The `thiserror` Crate
/// - `#[derive(Error)]` implements the `std::error::Error` trait
/// - `#[error("...")]` provides human-readable error messages
/// - `#[from]` enables automatic conversion from other error types with `?`
#[derive(Error, Debug)]
pub enum RelayError {
    /// Fatal misconfiguration; blocks a trigger before any outbound call
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Webhook signature or timestamp failed verification
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed request or webhook payload
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Network error, timeout or 5xx from an external endpoint
    #[error("Transient network error calling {endpoint}: {message}")]
    TransientNetwork { endpoint: String, message: String },

    /// The external endpoint asked us to slow down
    #[error("Rate limited by {endpoint}")]
    RateLimited {
        endpoint: String,
        retry_after: Option<std::time::Duration>,
    },

    /// Breaker for the endpoint is open and no fallback was cached
    #[error("Circuit open for {endpoint}")]
    CircuitOpen { endpoint: String },

    /// Identical webhook already processed; callers treat this as a no-op ack
    #[error("Duplicate event {dedup_hash}")]
    DuplicateEvent { dedup_hash: String },

    /// Agent or workflow exceeded its execution window
    #[error("Workflow {workflow_run_id} timed out")]
    WorkflowTimeout { workflow_run_id: Uuid },

    /// A run is already active for this session
    #[error("Session {session_id} already has active run {active_run_id}")]
    ConcurrentTrigger {
        session_id: String,
        active_run_id: Uuid,
    },

    /// Attempted agent state change along an edge that does not exist
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Webhook processing did not finish inside its time budget
    #[error("Processing exceeded budget of {budget_ms}ms")]
    ProcessingTimeout { budget_ms: u64 },

    /// Live call failed and no unexpired fallback exists
    #[error("{endpoint} unavailable: {reason}")]
    Unavailable { endpoint: String, reason: String },

    /// Cooperative cancellation reached an in-flight operation
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage backend failures
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// HTTP status code the API layer reports for this error
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::Configuration(_) => 500,
            RelayError::Authentication(_) => 401,
            RelayError::Validation(_) => 400,
            RelayError::TransientNetwork { .. } => 502,
            RelayError::RateLimited { .. } => 429,
            RelayError::CircuitOpen { .. } => 503,
            RelayError::DuplicateEvent { .. } => 200,
            RelayError::WorkflowTimeout { .. } => 408,
            RelayError::ConcurrentTrigger { .. } => 409,
            RelayError::InvalidTransition { .. } => 409,
            RelayError::ProcessingTimeout { .. } => 504,
            RelayError::Unavailable { .. } => 503,
            RelayError::Cancelled => 409,
            RelayError::NotFound(_) => 404,
            RelayError::Storage(_) => 503,
            RelayError::Serialization(_) => 400,
            RelayError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable name for the error class
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Configuration(_) => "configuration_error",
            RelayError::Authentication(_) => "authentication_error",
            RelayError::Validation(_) => "validation_error",
            RelayError::TransientNetwork { .. } => "transient_network_error",
            RelayError::RateLimited { .. } => "rate_limit_error",
            RelayError::CircuitOpen { .. } => "circuit_open_error",
            RelayError::DuplicateEvent { .. } => "duplicate_event",
            RelayError::WorkflowTimeout { .. } => "workflow_timeout_error",
            RelayError::ConcurrentTrigger { .. } => "concurrent_trigger_error",
            RelayError::InvalidTransition { .. } => "invalid_transition",
            RelayError::ProcessingTimeout { .. } => "processing_timeout",
            RelayError::Unavailable { .. } => "unavailable",
            RelayError::Cancelled => "cancelled",
            RelayError::NotFound(_) => "not_found",
            RelayError::Storage(_) => "storage_error",
            RelayError::Serialization(_) => "serialization_error",
            RelayError::Internal(_) => "internal_error",
        }
    }

    /// Whether the reliability layer may spend retry budget on this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::TransientNetwork { .. } | RelayError::RateLimited { .. }
        )
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}

impl From<::config::ConfigError> for RelayError {
    fn from(err: ::config::ConfigError) -> Self {
        RelayError::Configuration(err.to_string())
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(RelayError::Authentication("bad sig".into()).status_code(), 401);
        assert_eq!(RelayError::Validation("bad body".into()).status_code(), 400);
        assert_eq!(
            RelayError::ConcurrentTrigger {
                session_id: "s".into(),
                active_run_id: Uuid::new_v4(),
            }
            .status_code(),
            409
        );
        assert_eq!(
            RelayError::CircuitOpen { endpoint: "platform".into() }.status_code(),
            503
        );
    }

    #[test]
    fn test_only_transient_classes_are_retryable() {
        assert!(RelayError::TransientNetwork {
            endpoint: "platform".into(),
            message: "reset".into(),
        }
        .is_retryable());
        assert!(RelayError::RateLimited {
            endpoint: "platform".into(),
            retry_after: None,
        }
        .is_retryable());
        assert!(!RelayError::Validation("x".into()).is_retryable());
        assert!(!RelayError::Authentication("x".into()).is_retryable());
    }
}
