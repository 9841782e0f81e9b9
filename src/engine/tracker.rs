// State tracker: agent and workflow state machines, progress aggregation
// Owns every mutation of WorkflowRun and AgentExecution after the trigger

//! # State Tracker
//!
//! The tracker is the single writer for run and agent state. Webhook events,
//! the liveness monitor, the retry worker and cancel requests all funnel
//! through it.
//!
//! ## Serialization
//!
//! - Events for one `(run, agent)` pair are applied under that pair's lock
//! - Aggregation and run-level overrides run under the run's lock
//! - The agent lock is always released before the run lock is taken, so the
//!   two paths never wait on each other
//!
//! ## Workflow Status
//!
//! - `initiated` until some agent has moved past `starting`
//! - `in_progress` while anything is still active
//! - `failed` as soon as the [`FailurePolicy`] says so
//! - `completed` once every agent has settled without tripping the policy
//!
//! `cancelled` and `timeout` are overrides: they are forced onto the run and
//! every still-active agent is moved to `cancelled` / `timeout`.
//!
//! Once a run is terminal its session is released, metrics are recorded,
//! settled agents are archived and the run's cancellation token fires.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::sessions::SessionRegistry;
use crate::engine::storage::RelayStorage;
use crate::engine::stream::EventStreamPublisher;
use crate::models::{
    AckOutcome, AgentExecution, AgentId, AgentSpec, AgentState, DataSource, FallbackRecord,
    StateChange, WorkflowMetrics, WorkflowRun, WorkflowStatus,
};
use crate::{RelayError, Result};

/// When a run is declared failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail only if every agent failed; mixed outcomes complete
    AllAgentsFail,
    /// Fail as soon as any critical agent has failed for good
    #[default]
    AnyCritical,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How long a started agent may run before the liveness check times it out
    pub execution_window: Duration,
    /// Automatic re-dispatches per agent after failure or timeout
    pub max_agent_retries: u32,
    pub workflow_timeout: Duration,
    pub failure_policy: FailurePolicy,
    pub fallback_ttl: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            execution_window: Duration::from_secs(600),
            max_agent_retries: 2,
            workflow_timeout: Duration::from_secs(1800),
            failure_policy: FailurePolicy::default(),
            fallback_ttl: Duration::from_secs(3600),
        }
    }
}

/// Ask the trigger gateway to re-dispatch one agent
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRequest {
    pub workflow_run_id: Uuid,
    pub agent_id: AgentId,
    pub attempt: u32,
}

/// One agent-level state change requested from outside the tracker
#[derive(Debug, Clone)]
pub struct AgentUpdate {
    pub target: AgentState,
    pub sequence_offset: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl AgentUpdate {
    pub fn started(sequence_offset: u64) -> Self {
        Self {
            target: AgentState::Running,
            sequence_offset: Some(sequence_offset),
            result: None,
            error: None,
        }
    }

    pub fn completed(sequence_offset: u64, result: Value) -> Self {
        Self {
            target: AgentState::Completed,
            sequence_offset: Some(sequence_offset),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(sequence_offset: u64, error: impl Into<String>) -> Self {
        Self {
            target: AgentState::Failed,
            sequence_offset: Some(sequence_offset),
            result: None,
            error: Some(error.into()),
        }
    }

    fn timed_out(error: String) -> Self {
        Self {
            target: AgentState::Timeout,
            sequence_offset: None,
            result: None,
            error: Some(error),
        }
    }
}

/// What one liveness sweep changed
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub timed_out_agents: Vec<(Uuid, AgentId)>,
    pub timed_out_runs: Vec<Uuid>,
}

/// What [`StateTracker::advance_agent`] did with one update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Applied,
    /// The agent already sits at the target (redelivery after a partial apply)
    AlreadyThere,
    Ignored,
}

impl Step {
    fn ack(self) -> AckOutcome {
        match self {
            Step::Applied => AckOutcome::Applied,
            Step::AlreadyThere | Step::Ignored => AckOutcome::Ignored,
        }
    }
}

pub struct StateTracker {
    config: TrackerConfig,
    storage: Arc<dyn RelayStorage>,
    publisher: Arc<EventStreamPublisher>,
    sessions: Arc<SessionRegistry>,
    agent_locks: DashMap<(Uuid, AgentId), Arc<Mutex<()>>>,
    run_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    cancellations: DashMap<Uuid, CancellationToken>,
    retry_tx: Option<mpsc::UnboundedSender<RetryRequest>>,
}

impl StateTracker {
    pub fn new(
        config: TrackerConfig,
        storage: Arc<dyn RelayStorage>,
        publisher: Arc<EventStreamPublisher>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            config,
            storage,
            publisher,
            sessions,
            agent_locks: DashMap::new(),
            run_locks: DashMap::new(),
            cancellations: DashMap::new(),
            retry_tx: None,
        }
    }

    /// Enables automatic agent retries; requests go to `sender`
    pub fn with_retry_sender(mut self, sender: mpsc::UnboundedSender<RetryRequest>) -> Self {
        self.retry_tx = Some(sender);
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn RelayStorage> {
        &self.storage
    }

    pub fn publisher(&self) -> &Arc<EventStreamPublisher> {
        &self.publisher
    }

    /// Token that fires when the run reaches a terminal state
    pub fn cancellation(&self, workflow_run_id: Uuid) -> Option<CancellationToken> {
        self.cancellations
            .get(&workflow_run_id)
            .map(|token| token.value().clone())
    }

    /// Creates one idle agent record per scheduled agent
    pub async fn schedule_run(
        &self,
        run: &WorkflowRun,
        agents: &[AgentSpec],
    ) -> Result<CancellationToken> {
        for spec in agents {
            self.storage
                .upsert_agent(AgentExecution::new(run.id, spec))
                .await?;
        }
        let token = CancellationToken::new();
        self.cancellations.insert(run.id, token.clone());
        debug!(
            workflow_run_id = %run.id,
            correlation_id = %run.correlation_id,
            agents = agents.len(),
            "Scheduled workflow run"
        );
        Ok(token)
    }

    /// Records how the platform answered the trigger call
    ///
    /// A live answer moves idle agents to `starting`; a fallback answer
    /// leaves them idle until the workflow timeout settles the run.
    pub async fn mark_dispatched(&self, workflow_run_id: Uuid, source: DataSource) -> Result<()> {
        {
            let lock = self.run_lock(workflow_run_id);
            let _guard = lock.lock().await;
            let mut run = self.load_run(workflow_run_id).await?;
            if run.is_terminal() {
                return Ok(());
            }
            run.dispatch_source = Some(source);
            self.storage.update_run(run).await?;
        }

        if source == DataSource::Live {
            for agent in self.storage.list_agents(&workflow_run_id).await? {
                if agent.state == AgentState::Idle {
                    self.advance_agent(
                        workflow_run_id,
                        &agent.agent_id,
                        AgentUpdate {
                            target: AgentState::Starting,
                            sequence_offset: None,
                            result: None,
                            error: None,
                        },
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Applies an agent-level event and re-aggregates the run
    pub async fn apply_agent_event(
        &self,
        workflow_run_id: Uuid,
        agent_id: &AgentId,
        update: AgentUpdate,
    ) -> Result<AckOutcome> {
        let step = self.advance_agent(workflow_run_id, agent_id, update).await?;
        // An earlier delivery may have stored the agent without re-aggregating
        if matches!(step, Step::Applied | Step::AlreadyThere) {
            self.recompute_aggregate(workflow_run_id).await?;
        }
        Ok(step.ack())
    }

    /// Publishes intermediate agent output
    pub async fn record_data(
        &self,
        workflow_run_id: Uuid,
        agent_id: Option<AgentId>,
        data: Value,
    ) -> Result<AckOutcome> {
        let run = self.load_run(workflow_run_id).await?;
        if run.is_terminal() {
            return Ok(AckOutcome::Ignored);
        }
        self.publisher
            .publish(workflow_run_id, StateChange::DataReceived { agent_id, data });
        Ok(AckOutcome::Applied)
    }

    /// Platform-reported end of the whole workflow
    pub async fn apply_workflow_outcome(
        &self,
        workflow_run_id: Uuid,
        status: WorkflowStatus,
        error: Option<String>,
    ) -> Result<AckOutcome> {
        if !status.is_terminal() {
            return Err(RelayError::Validation(format!(
                "{} is not a terminal workflow status",
                status
            )));
        }
        let lock = self.run_lock(workflow_run_id);
        let _guard = lock.lock().await;
        let run = self.load_run(workflow_run_id).await?;
        if run.is_terminal() {
            return Ok(AckOutcome::Ignored);
        }
        self.finalize_locked(run, status, error).await?;
        Ok(AckOutcome::Applied)
    }

    /// Cancels a run; cancelling a finished run returns it unchanged
    pub async fn cancel_run(&self, workflow_run_id: Uuid) -> Result<WorkflowRun> {
        let lock = self.run_lock(workflow_run_id);
        let _guard = lock.lock().await;
        let run = self.load_run(workflow_run_id).await?;
        if run.is_terminal() {
            return Ok(run);
        }
        self.finalize_locked(run, WorkflowStatus::Cancelled, Some("cancelled by request".into()))
            .await
    }

    /// Fails a run outright (e.g. the platform could not be reached)
    pub async fn fail_run(&self, workflow_run_id: Uuid, error: impl Into<String>) -> Result<WorkflowRun> {
        let lock = self.run_lock(workflow_run_id);
        let _guard = lock.lock().await;
        let run = self.load_run(workflow_run_id).await?;
        if run.is_terminal() {
            return Ok(run);
        }
        self.finalize_locked(run, WorkflowStatus::Failed, Some(error.into()))
            .await
    }

    /// Moves a retrying agent back to `starting` after re-dispatch
    pub async fn restart_agent(&self, workflow_run_id: Uuid, agent_id: &AgentId) -> Result<bool> {
        let step = self
            .advance_agent(
                workflow_run_id,
                agent_id,
                AgentUpdate {
                    target: AgentState::Starting,
                    sequence_offset: None,
                    result: None,
                    error: None,
                },
            )
            .await?;
        Ok(step == Step::Applied)
    }

    /// Re-dispatch failed; counts as another timeout for the agent
    ///
    /// With the retry budget spent the agent settles as `failed`.
    pub async fn abandon_retry(
        &self,
        workflow_run_id: Uuid,
        agent_id: &AgentId,
        error: impl Into<String>,
    ) -> Result<()> {
        {
            let lock = self.agent_lock(workflow_run_id, agent_id);
            let _guard = lock.lock().await;
            let Some(mut agent) = self.storage.get_agent(&workflow_run_id, agent_id).await? else {
                return Ok(());
            };
            if agent.state != AgentState::Retrying {
                return Ok(());
            }
            let from = agent.state;
            agent.force(AgentState::Timeout)?;
            agent.error_message = Some(error.into());
            self.publish_transition(&agent, from);
            let agent = self.storage.upsert_agent(agent).await?;
            self.maybe_schedule_retry(agent).await?;
        }
        self.recompute_aggregate(workflow_run_id).await?;
        Ok(())
    }

    /// Liveness check: times out overdue agents and runs
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let workflow_timeout = to_chrono(self.config.workflow_timeout);

        for run in self.storage.list_active_runs().await? {
            if now - run.started_at >= workflow_timeout {
                let lock = self.run_lock(run.id);
                let _guard = lock.lock().await;
                let current = self.load_run(run.id).await?;
                if !current.is_terminal() {
                    warn!(
                        workflow_run_id = %run.id,
                        correlation_id = %run.correlation_id,
                        "⏰ Workflow exceeded its timeout"
                    );
                    let message = RelayError::WorkflowTimeout {
                        workflow_run_id: run.id,
                    }
                    .to_string();
                    self.finalize_locked(current, WorkflowStatus::Timeout, Some(message))
                        .await?;
                    report.timed_out_runs.push(run.id);
                }
                continue;
            }

            let mut touched = false;
            for agent in self.storage.list_agents(&run.id).await? {
                if agent.state != AgentState::Running {
                    continue;
                }
                let window = agent
                    .max_execution_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.config.execution_window);
                if now - agent.last_updated_at < to_chrono(window) {
                    continue;
                }
                let message = format!("no completion within {}s", window.as_secs());
                let step = self
                    .advance_agent(run.id, &agent.agent_id, AgentUpdate::timed_out(message))
                    .await?;
                if step == Step::Applied {
                    warn!(
                        workflow_run_id = %run.id,
                        agent_id = %agent.agent_id,
                        "⏰ Agent timed out"
                    );
                    report.timed_out_agents.push((run.id, agent.agent_id.clone()));
                    touched = true;
                }
            }
            if touched {
                self.recompute_aggregate(run.id).await?;
            }
        }
        self.prune_locks().await?;
        self.publisher.prune(now);
        Ok(report)
    }

    /// Recomputes progress and workflow status from the agent records
    pub async fn recompute_aggregate(&self, workflow_run_id: Uuid) -> Result<WorkflowRun> {
        let lock = self.run_lock(workflow_run_id);
        let _guard = lock.lock().await;
        let mut run = self.load_run(workflow_run_id).await?;
        if run.is_terminal() {
            return Ok(run);
        }

        let agents = self.storage.list_agents(&workflow_run_id).await?;
        let progress = progress_percent(&agents, run.scheduled_agent_count);
        let next = derive_status(&agents, self.config.failure_policy, run.status);

        if (progress - run.progress_percent).abs() > f64::EPSILON {
            run.progress_percent = progress;
            self.publisher.publish(
                workflow_run_id,
                StateChange::ProgressUpdated {
                    progress_percent: progress,
                },
            );
            self.storage.put_fallback(self.run_fallback(&run, &agents)).await?;
        }

        if next == run.status {
            return self.storage.update_run(run).await;
        }
        if next.is_terminal() {
            let error = (next == WorkflowStatus::Failed).then(|| failure_summary(&agents));
            return self.finalize_locked(run, next, error).await;
        }

        let previous = run.status;
        run.status = next;
        info!(
            workflow_run_id = %run.id,
            correlation_id = %run.correlation_id,
            from = %previous,
            to = %next,
            progress_percent = run.progress_percent,
            "Workflow status changed"
        );
        self.publisher.publish(
            workflow_run_id,
            StateChange::WorkflowStatusChanged {
                from: previous,
                to: next,
                progress_percent: run.progress_percent,
            },
        );
        self.storage.update_run(run).await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn agent_lock(&self, workflow_run_id: Uuid, agent_id: &AgentId) -> Arc<Mutex<()>> {
        self.agent_locks
            .entry((workflow_run_id, agent_id.clone()))
            .or_default()
            .value()
            .clone()
    }

    fn run_lock(&self, workflow_run_id: Uuid) -> Arc<Mutex<()>> {
        self.run_locks
            .entry(workflow_run_id)
            .or_default()
            .value()
            .clone()
    }

    /// Drops idle locks of runs that are no longer active
    ///
    /// Late calls for finished runs recreate entries; a lock still held or
    /// awaited elsewhere has more than one owner and is kept.
    async fn prune_locks(&self) -> Result<()> {
        let active: HashSet<Uuid> = self
            .storage
            .list_active_runs()
            .await?
            .into_iter()
            .map(|run| run.id)
            .collect();
        self.run_locks
            .retain(|run_id, lock| active.contains(run_id) || Arc::strong_count(lock) > 1);
        self.agent_locks
            .retain(|(run_id, _), lock| active.contains(run_id) || Arc::strong_count(lock) > 1);
        Ok(())
    }

    async fn load_run(&self, workflow_run_id: Uuid) -> Result<WorkflowRun> {
        self.storage
            .get_run(&workflow_run_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("workflow run {}", workflow_run_id)))
    }

    /// Walks one agent toward `update.target` under its lock
    async fn advance_agent(
        &self,
        workflow_run_id: Uuid,
        agent_id: &AgentId,
        update: AgentUpdate,
    ) -> Result<Step> {
        let lock = self.agent_lock(workflow_run_id, agent_id);
        let _guard = lock.lock().await;

        let run = self.load_run(workflow_run_id).await?;
        if run.is_terminal() {
            debug!(workflow_run_id = %workflow_run_id, agent_id = %agent_id, "Run already terminal, event ignored");
            return Ok(Step::Ignored);
        }
        let Some(mut agent) = self.storage.get_agent(&workflow_run_id, agent_id).await? else {
            warn!(workflow_run_id = %workflow_run_id, agent_id = %agent_id, "Event for unscheduled agent ignored");
            return Ok(Step::Ignored);
        };

        if let (Some(offset), Some(last)) = (update.sequence_offset, agent.last_sequence_offset) {
            if offset < last {
                debug!(
                    workflow_run_id = %workflow_run_id,
                    agent_id = %agent_id,
                    offset,
                    last,
                    "Stale event ignored"
                );
                return Ok(Step::Ignored);
            }
        }

        if agent.state == update.target {
            return Ok(Step::AlreadyThere);
        }
        let Some(path) = agent.state.path_to(update.target) else {
            warn!(
                workflow_run_id = %workflow_run_id,
                agent_id = %agent_id,
                from = %agent.state,
                to = %update.target,
                "Rejected invalid agent transition"
            );
            return Ok(Step::Ignored);
        };

        for step in path {
            let from = agent.state;
            agent.transition(step)?;
            self.publish_transition(&agent, from);
        }
        if let Some(offset) = update.sequence_offset {
            agent.last_sequence_offset = Some(agent.last_sequence_offset.map_or(offset, |last| last.max(offset)));
        }
        if let Some(result) = update.result {
            let record = FallbackRecord::new(
                format!("{}:{}", workflow_run_id, agent_id),
                result.clone(),
                to_chrono(self.config.fallback_ttl),
            );
            self.storage.put_fallback(record).await?;
            agent.result_payload = Some(result);
        }
        if update.error.is_some() {
            agent.error_message = update.error;
        }

        info!(
            workflow_run_id = %workflow_run_id,
            correlation_id = %run.correlation_id,
            agent_id = %agent_id,
            state = %agent.state,
            retry_count = agent.retry_count,
            "Agent state updated"
        );
        let agent = self.storage.upsert_agent(agent).await?;
        self.maybe_schedule_retry(agent).await?;
        Ok(Step::Applied)
    }

    /// Moves a freshly failed agent to `retrying` while budget remains
    ///
    /// An agent that already used up its retries settles as `failed`.
    /// Caller holds the agent lock.
    async fn maybe_schedule_retry(&self, mut agent: AgentExecution) -> Result<()> {
        if !matches!(agent.state, AgentState::Failed | AgentState::Timeout) {
            return Ok(());
        }
        if agent.retry_count > 0 && agent.retry_count >= self.config.max_agent_retries {
            let from = agent.state;
            if agent.exhaust_retries() {
                self.publish_transition(&agent, from);
                self.storage.upsert_agent(agent.clone()).await?;
            }
            warn!(
                workflow_run_id = %agent.workflow_run_id,
                agent_id = %agent.agent_id,
                retry_count = agent.retry_count,
                error = agent.error_message.as_deref().unwrap_or("-"),
                "Agent retries exhausted"
            );
            return Ok(());
        }
        let Some(sender) = &self.retry_tx else {
            return Ok(());
        };
        if agent.retry_count >= self.config.max_agent_retries {
            return Ok(());
        }

        let from = agent.state;
        agent.transition(AgentState::Retrying)?;
        self.publish_transition(&agent, from);
        let agent = self.storage.upsert_agent(agent).await?;

        let request = RetryRequest {
            workflow_run_id: agent.workflow_run_id,
            agent_id: agent.agent_id.clone(),
            attempt: agent.retry_count,
        };
        info!(
            workflow_run_id = %agent.workflow_run_id,
            agent_id = %agent.agent_id,
            attempt = agent.retry_count,
            max_retries = self.config.max_agent_retries,
            "🔄 Scheduling agent retry"
        );
        if sender.send(request).is_err() {
            warn!(agent_id = %agent.agent_id, "Retry worker is gone; agent stays in retrying until the run times out");
        }
        Ok(())
    }

    fn publish_transition(&self, agent: &AgentExecution, from: AgentState) {
        self.publisher.publish(
            agent.workflow_run_id,
            StateChange::AgentTransitioned {
                agent_id: agent.agent_id.clone(),
                from,
                to: agent.state,
                retry_count: agent.retry_count,
            },
        );
    }

    /// Forces `status` onto a run; caller holds the run lock
    async fn finalize_locked(
        &self,
        mut run: WorkflowRun,
        status: WorkflowStatus,
        error: Option<String>,
    ) -> Result<WorkflowRun> {
        let override_state = status.override_agent_state();
        let mut agents = Vec::new();

        // Forced states are stored before the agent lock drops, so an event
        // racing the run update finds the agent settled
        for agent in self.storage.list_agents(&run.id).await? {
            let lock = self.agent_lock(run.id, &agent.agent_id);
            let _guard = lock.lock().await;
            let Some(mut agent) = self.storage.get_agent(&run.id, &agent.agent_id).await? else {
                continue;
            };
            if let Some(forced) = override_state {
                if agent.state.can_be_overridden_to(forced) {
                    let from = agent.state;
                    agent.force(forced)?;
                    self.publish_transition(&agent, from);
                    agent = self.storage.upsert_agent(agent).await?;
                }
            }
            agents.push(agent);
        }

        run.progress_percent = progress_percent(&agents, run.scheduled_agent_count);
        let metrics = workflow_metrics(&run, &agents);
        let previous = run.status;
        run.finish(status, error);
        run.metrics = Some(metrics.clone());
        let run = self.storage.update_run(run).await?;
        self.storage.put_fallback(self.run_fallback(&run, &agents)).await?;

        self.publisher.publish(
            run.id,
            StateChange::WorkflowStatusChanged {
                from: previous,
                to: status,
                progress_percent: run.progress_percent,
            },
        );

        for agent in &agents {
            let lock = self.agent_lock(run.id, &agent.agent_id);
            let _guard = lock.lock().await;
            let Some(mut agent) = self.storage.get_agent(&run.id, &agent.agent_id).await? else {
                continue;
            };
            if agent.state.is_terminal() {
                let from = agent.state;
                agent.transition(AgentState::Archived)?;
                self.publish_transition(&agent, from);
                self.storage.upsert_agent(agent).await?;
            }
        }

        self.sessions.release(&run.session_id, run.id);
        if let Some((_, token)) = self.cancellations.remove(&run.id) {
            token.cancel();
        }
        self.publisher.close(run.id);
        self.agent_locks.retain(|(run_id, _), _| *run_id != run.id);
        self.run_locks.remove(&run.id);

        let emoji = if status == WorkflowStatus::Completed { "✅" } else { "❌" };
        info!(
            workflow_run_id = %run.id,
            correlation_id = %run.correlation_id,
            session_id = %run.session_id,
            status = %status,
            progress_percent = run.progress_percent,
            completed = metrics.completed,
            failed = metrics.failed,
            timed_out = metrics.timed_out,
            duration_ms = metrics.duration_ms,
            "{} Workflow run finished",
            emoji
        );
        Ok(run)
    }

    fn run_fallback(&self, run: &WorkflowRun, agents: &[AgentExecution]) -> FallbackRecord {
        let results: Map<String, Value> = agents
            .iter()
            .filter_map(|agent| {
                agent
                    .result_payload
                    .clone()
                    .map(|result| (agent.agent_id.to_string(), result))
            })
            .collect();
        FallbackRecord::new(
            run.id.to_string(),
            json!({
                "workflowRunId": run.id,
                "status": run.status,
                "progressPercent": run.progress_percent,
                "results": results,
            }),
            to_chrono(self.config.fallback_ttl),
        )
    }
}

/// `completed / scheduled × 100`, rounded to two decimals
///
/// Exactly 100 only once every scheduled agent has completed.
pub fn progress_percent(agents: &[AgentExecution], scheduled: u32) -> f64 {
    let scheduled = scheduled.max(agents.len() as u32);
    if scheduled == 0 {
        return 0.0;
    }
    let completed = agents
        .iter()
        .filter(|agent| agent.outcome() == AgentState::Completed)
        .count();
    if completed as u32 >= scheduled {
        return 100.0;
    }
    let percent = completed as f64 / f64::from(scheduled) * 100.0;
    ((percent * 100.0).round() / 100.0).min(99.99)
}

/// Workflow status implied by the agent records; never moves backwards
pub fn derive_status(
    agents: &[AgentExecution],
    policy: FailurePolicy,
    current: WorkflowStatus,
) -> WorkflowStatus {
    if agents.is_empty() {
        return current;
    }
    let settled = agents.iter().all(|agent| agent.outcome().is_terminal());
    let failed = match policy {
        FailurePolicy::AnyCritical => agents
            .iter()
            .any(|agent| agent.critical && agent.is_failed()),
        FailurePolicy::AllAgentsFail => settled && agents.iter().all(|agent| agent.is_failed()),
    };

    if failed {
        WorkflowStatus::Failed
    } else if settled {
        WorkflowStatus::Completed
    } else if current == WorkflowStatus::InProgress
        || agents
            .iter()
            .any(|agent| !matches!(agent.outcome(), AgentState::Idle | AgentState::Starting))
    {
        WorkflowStatus::InProgress
    } else {
        WorkflowStatus::Initiated
    }
}

fn failure_summary(agents: &[AgentExecution]) -> String {
    let failed: Vec<String> = agents
        .iter()
        .filter(|agent| agent.is_failed())
        .map(|agent| match &agent.error_message {
            Some(message) => format!("{}: {}", agent.agent_id, message),
            None => agent.agent_id.to_string(),
        })
        .collect();
    format!("agents failed: {}", failed.join("; "))
}

fn workflow_metrics(run: &WorkflowRun, agents: &[AgentExecution]) -> WorkflowMetrics {
    let mut metrics = WorkflowMetrics {
        duration_ms: (Utc::now() - run.started_at).num_milliseconds(),
        ..WorkflowMetrics::default()
    };
    for agent in agents {
        metrics.total_retries += agent.retry_count;
        match agent.outcome() {
            AgentState::Completed => metrics.completed += 1,
            AgentState::Failed => metrics.failed += 1,
            AgentState::Timeout => metrics.timed_out += 1,
            AgentState::Cancelled => metrics.cancelled += 1,
            _ => {}
        }
    }
    metrics
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::max_value())
}

#[cfg(test)]
#[path = "tracker_tests.rs"]
mod tests;
