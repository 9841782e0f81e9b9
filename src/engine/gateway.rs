// Trigger gateway: starts workflow runs on the agent platform
// Enforces one active run per session and dispatches asynchronously

//! # Trigger Gateway
//!
//! `trigger` validates the request, claims the session, persists the run in
//! `initiated` and returns immediately. The platform call happens on a
//! spawned task through the [`ReliabilityInvoker`], so the caller never
//! waits on retries or backoff:
//!
//! ```text
//! trigger() ──► claim session ──► create run ──► schedule agents ──► return run
//!                                                     │
//!                                          tokio::spawn(dispatch)
//!                                                     │
//!               live ack ──► agents → starting        │ unavailable ──► run failed
//! ```
//!
//! The session claim is released by the tracker when the run reaches a
//! terminal state, whichever path gets it there.
//!
//! The gateway also owns the retry worker: the tracker asks for an agent
//! re-dispatch over a channel and the worker calls the platform again.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::invoker::{CallMeta, ReliabilityInvoker};
use crate::engine::sessions::SessionRegistry;
use crate::engine::storage::RelayStorage;
use crate::engine::tracker::{RetryRequest, StateTracker};
use crate::models::{AgentSpec, TriggerSource, WorkflowRun};
use crate::{RelayError, Result};

/// A request to start one workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    /// Generated when absent; a generated id never collides with another run
    pub session_id: Option<String>,
    pub scope: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub trigger_source: TriggerSource,
    /// Assigned by the HTTP layer before validation so errors can carry it
    #[serde(skip)]
    pub correlation_id: Option<String>,
}

impl TriggerRequest {
    pub fn new(session_id: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            scope: scope.into(),
            context: Value::Null,
            trigger_source: TriggerSource::Api,
            correlation_id: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

pub struct TriggerGateway {
    platform_endpoint: String,
    scopes: HashMap<String, Vec<AgentSpec>>,
    invoker: Arc<ReliabilityInvoker>,
    tracker: Arc<StateTracker>,
    sessions: Arc<SessionRegistry>,
    storage: Arc<dyn RelayStorage>,
}

impl TriggerGateway {
    pub fn new(
        platform_endpoint: impl Into<String>,
        scopes: HashMap<String, Vec<AgentSpec>>,
        invoker: Arc<ReliabilityInvoker>,
        tracker: Arc<StateTracker>,
        sessions: Arc<SessionRegistry>,
        storage: Arc<dyn RelayStorage>,
    ) -> Self {
        Self {
            platform_endpoint: platform_endpoint.into(),
            scopes,
            invoker,
            tracker,
            sessions,
            storage,
        }
    }

    pub fn scopes(&self) -> &HashMap<String, Vec<AgentSpec>> {
        &self.scopes
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Creates a run and dispatches it in the background
    pub async fn trigger(self: &Arc<Self>, request: TriggerRequest) -> Result<WorkflowRun> {
        let agents = self.scopes.get(&request.scope).ok_or_else(|| {
            RelayError::Validation(format!("unknown scope '{}'", request.scope))
        })?;
        if agents.is_empty() {
            return Err(RelayError::Configuration(format!(
                "scope '{}' schedules no agents",
                request.scope
            )));
        }
        if !self.invoker.has_endpoint(&self.platform_endpoint) {
            return Err(RelayError::Configuration(format!(
                "platform endpoint '{}' is not configured",
                self.platform_endpoint
            )));
        }
        let session_id = match request.session_id {
            Some(id) if id.trim().is_empty() => {
                return Err(RelayError::Validation("sessionId must not be blank".to_string()))
            }
            Some(id) => id,
            None => format!("session-{}", Uuid::new_v4().simple()),
        };

        let mut run = WorkflowRun::new(
            session_id,
            request.scope,
            request.trigger_source,
            request.context,
            agents.len() as u32,
        );
        if let Some(correlation_id) = request.correlation_id {
            run = run.with_correlation_id(correlation_id);
        }
        self.sessions.try_claim(&run.session_id, run.id)?;

        let token = match self.persist(&run, agents).await {
            Ok(token) => token,
            Err(e) => {
                self.sessions.release(&run.session_id, run.id);
                return Err(e);
            }
        };

        info!(
            workflow_run_id = %run.id,
            correlation_id = %run.correlation_id,
            session_id = %run.session_id,
            scope = %run.scope,
            agents = agents.len(),
            "🚀 Workflow run triggered"
        );

        let gateway = Arc::clone(self);
        let dispatched = run.clone();
        tokio::spawn(async move {
            gateway.dispatch(dispatched, token).await;
        });
        Ok(run)
    }

    async fn persist(&self, run: &WorkflowRun, agents: &[AgentSpec]) -> Result<CancellationToken> {
        self.storage.create_run(run.clone()).await?;
        self.tracker.schedule_run(run, agents).await
    }

    /// Calls the platform for a freshly created run
    pub async fn dispatch(&self, run: WorkflowRun, token: CancellationToken) {
        let agents: Vec<String> = self
            .scopes
            .get(&run.scope)
            .map(|specs| specs.iter().map(|spec| spec.agent_id.to_string()).collect())
            .unwrap_or_default();
        let payload = json!({
            "workflowRunId": run.id,
            "correlationId": run.correlation_id,
            "scope": run.scope,
            "agents": agents,
            "context": run.context,
        });
        let meta = CallMeta::new(&run.correlation_id, format!("dispatch:{}", run.scope))
            .with_cancellation(token);

        let outcome = match self
            .invoker
            .execute_call(&self.platform_endpoint, &payload, &meta)
            .await
        {
            Ok(result) => {
                if result.is_fallback() {
                    warn!(
                        workflow_run_id = %run.id,
                        correlation_id = %run.correlation_id,
                        "Platform unavailable; run answered from cached dispatch"
                    );
                }
                self.tracker.mark_dispatched(run.id, result.source).await
            }
            Err(RelayError::Cancelled) => {
                debug!(workflow_run_id = %run.id, "Dispatch cancelled with its run");
                Ok(())
            }
            Err(e) => {
                error!(
                    workflow_run_id = %run.id,
                    correlation_id = %run.correlation_id,
                    error = %e,
                    "Dispatch failed"
                );
                self.tracker.fail_run(run.id, e.to_string()).await.map(|_| ())
            }
        };
        if let Err(e) = outcome {
            error!(workflow_run_id = %run.id, error = %e, "Could not record dispatch outcome");
        }
    }

    /// Cancels a run; its in-flight platform calls stop with it
    pub async fn cancel(&self, workflow_run_id: Uuid) -> Result<WorkflowRun> {
        let run = self.tracker.cancel_run(workflow_run_id).await?;
        info!(
            workflow_run_id = %run.id,
            correlation_id = %run.correlation_id,
            status = %run.status,
            "🛑 Cancel requested"
        );
        Ok(run)
    }

    /// Consumes retry requests from the tracker until the channel closes
    pub fn spawn_retry_worker(
        self: &Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<RetryRequest>,
    ) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let gateway = Arc::clone(&gateway);
                tokio::spawn(async move {
                    if let Err(e) = gateway.redispatch(&request).await {
                        error!(
                            workflow_run_id = %request.workflow_run_id,
                            agent_id = %request.agent_id,
                            error = %e,
                            "Agent retry failed"
                        );
                    }
                });
            }
            debug!("Retry worker stopped");
        })
    }

    async fn redispatch(&self, request: &RetryRequest) -> Result<()> {
        let Some(run) = self.storage.get_run(&request.workflow_run_id).await? else {
            return Ok(());
        };
        if run.is_terminal() {
            return Ok(());
        }
        let Some(token) = self.tracker.cancellation(run.id) else {
            return Ok(());
        };

        let payload = json!({
            "workflowRunId": run.id,
            "correlationId": run.correlation_id,
            "scope": run.scope,
            "agentId": request.agent_id,
            "attempt": request.attempt,
            "context": run.context,
        });
        let meta = CallMeta::new(
            &run.correlation_id,
            format!("dispatch:{}:{}", run.id, request.agent_id),
        )
        .with_cancellation(token);

        match self
            .invoker
            .execute_call(&self.platform_endpoint, &payload, &meta)
            .await
        {
            Ok(result) if !result.is_fallback() => {
                self.tracker
                    .restart_agent(run.id, &request.agent_id)
                    .await?;
                Ok(())
            }
            Ok(_) => {
                self.tracker
                    .abandon_retry(run.id, &request.agent_id, "platform unavailable for retry")
                    .await
            }
            Err(RelayError::Cancelled) => Ok(()),
            Err(e) => {
                self.tracker
                    .abandon_retry(run.id, &request.agent_id, e.to_string())
                    .await
            }
        }
    }
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;
