// Storage abstraction for the relay engines
// This defines the interface for persisting runs, agents, webhook audit records and fallbacks

//! # Storage Abstraction Layer
//!
//! This module provides a storage abstraction that lets the engines persist
//! their entities through different backends. The engines never touch a
//! concrete store; they hold an `Arc<dyn RelayStorage>`.
//!
//! ## Storage Architecture
//!
//! The storage layer follows the **Repository Pattern**:
//! - **RelayStorage trait**: Defines the interface for all storage operations
//! - **InMemoryStorage**: Default implementation for development/testing
//!
//! Breaker state is deliberately absent: it lives in the process-wide
//! [`CircuitBreakerRegistry`](crate::engine::breaker::CircuitBreakerRegistry).
//!
//! ## Thread Safety
//!
//! - Multiple async tasks access storage concurrently
//! - `tokio::sync::RwLock` guards each table, so no lock is held across
//!   a poisoned state and no `.unwrap()` is needed on acquisition
//! - Send + Sync bounds ensure safe sharing across threads
//!
//! ## Rust Learning Notes:
//!
//! ### Async Traits
//! The `async-trait` crate provides a macro to enable async trait methods,
//! which is what lets us use `dyn RelayStorage` trait objects.

use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{AgentExecution, AgentId, FallbackRecord, WebhookEvent, WorkflowRun};
use crate::{RelayError, Result};

/// Storage trait for relay persistence
///
/// ## Return Value Conventions
/// `Result<Option<T>>` means:
/// - `Ok(Some(value))`: Found it
/// - `Ok(None)`: Nothing with that key (not an error)
/// - `Err(error)`: The backend itself failed
#[async_trait::async_trait]
pub trait RelayStorage: Send + Sync {
    /// Store a new workflow run; fails if the id already exists
    async fn create_run(&self, run: WorkflowRun) -> Result<WorkflowRun>;

    async fn get_run(&self, id: &Uuid) -> Result<Option<WorkflowRun>>;

    /// Replace a stored run
    async fn update_run(&self, run: WorkflowRun) -> Result<WorkflowRun>;

    /// Runs that have not reached a terminal status
    async fn list_active_runs(&self) -> Result<Vec<WorkflowRun>>;

    /// Create or replace the active record for `(workflow_run_id, agent_id)`
    async fn upsert_agent(&self, execution: AgentExecution) -> Result<AgentExecution>;

    async fn get_agent(&self, run_id: &Uuid, agent_id: &AgentId) -> Result<Option<AgentExecution>>;

    /// All agent records of a run, ordered by agent id
    async fn list_agents(&self, run_id: &Uuid) -> Result<Vec<AgentExecution>>;

    /// Append a webhook audit record; records are never modified afterwards
    async fn append_webhook_event(&self, event: WebhookEvent) -> Result<()>;

    /// First accepted, signature-valid event carrying `dedup_hash`
    async fn find_processed_event(&self, dedup_hash: &str) -> Result<Option<WebhookEvent>>;

    async fn list_webhook_events(&self, run_id: &Uuid) -> Result<Vec<WebhookEvent>>;

    async fn put_fallback(&self, record: FallbackRecord) -> Result<()>;

    async fn get_fallback(&self, key: &str) -> Result<Option<FallbackRecord>>;
}

/// In-memory storage implementation for development and testing
///
/// ## Limitations
///
/// - **Not persistent**: Data is lost when process restarts
/// - **Not distributed**: Cannot share data across multiple processes
/// - **Memory bound**: The webhook audit trail grows without bound
#[derive(Default)]
pub struct InMemoryStorage {
    runs: RwLock<HashMap<Uuid, WorkflowRun>>,
    /// Key: (workflow run id, agent id)
    agents: RwLock<HashMap<(Uuid, AgentId), AgentExecution>>,
    webhook_events: RwLock<Vec<WebhookEvent>>,
    fallbacks: RwLock<HashMap<String, FallbackRecord>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RelayStorage for InMemoryStorage {
    async fn create_run(&self, run: WorkflowRun) -> Result<WorkflowRun> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(RelayError::Validation(format!("run {} already exists", run.id)));
        }
        runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: &Uuid) -> Result<Option<WorkflowRun>> {
        let runs = self.runs.read().await;
        Ok(runs.get(id).cloned())
    }

    async fn update_run(&self, run: WorkflowRun) -> Result<WorkflowRun> {
        let mut runs = self.runs.write().await;
        runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn list_active_runs(&self) -> Result<Vec<WorkflowRun>> {
        let runs = self.runs.read().await;
        Ok(runs.values().filter(|run| !run.is_terminal()).cloned().collect())
    }

    async fn upsert_agent(&self, execution: AgentExecution) -> Result<AgentExecution> {
        let mut agents = self.agents.write().await;
        agents.insert(
            (execution.workflow_run_id, execution.agent_id.clone()),
            execution.clone(),
        );
        Ok(execution)
    }

    async fn get_agent(&self, run_id: &Uuid, agent_id: &AgentId) -> Result<Option<AgentExecution>> {
        let agents = self.agents.read().await;
        Ok(agents.get(&(*run_id, agent_id.clone())).cloned())
    }

    async fn list_agents(&self, run_id: &Uuid) -> Result<Vec<AgentExecution>> {
        let agents = self.agents.read().await;
        let mut listed: Vec<AgentExecution> = agents
            .values()
            .filter(|execution| execution.workflow_run_id == *run_id)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(listed)
    }

    async fn append_webhook_event(&self, event: WebhookEvent) -> Result<()> {
        let mut events = self.webhook_events.write().await;
        events.push(event);
        Ok(())
    }

    async fn find_processed_event(&self, dedup_hash: &str) -> Result<Option<WebhookEvent>> {
        let events = self.webhook_events.read().await;
        Ok(events
            .iter()
            .find(|event| {
                event.dedup_hash == dedup_hash
                    && event.signature_valid
                    && event.outcome.is_some()
                    && event.duplicate_of.is_none()
            })
            .cloned())
    }

    async fn list_webhook_events(&self, run_id: &Uuid) -> Result<Vec<WebhookEvent>> {
        let events = self.webhook_events.read().await;
        Ok(events
            .iter()
            .filter(|event| event.workflow_run_id == Some(*run_id))
            .cloned()
            .collect())
    }

    async fn put_fallback(&self, record: FallbackRecord) -> Result<()> {
        let mut fallbacks = self.fallbacks.write().await;
        fallbacks.insert(record.key.clone(), record);
        Ok(())
    }

    async fn get_fallback(&self, key: &str) -> Result<Option<FallbackRecord>> {
        let fallbacks = self.fallbacks.read().await;
        Ok(fallbacks.get(key).cloned())
    }
}
