// Status query with a bounded polling contract

//! # Status Query
//!
//! Builds the snapshot consumers poll. Three properties matter:
//!
//! - **Bounded polling**: the server counts polls per run and flips
//!   `should_continue_polling` to `false` after `max_attempts` polls, after
//!   `max_duration` since the run started, or once the run is terminal.
//!   Clients never decide on their own when to stop.
//! - **Stale degradation**: when storage fails, the last snapshot served for
//!   the run is returned with `stale = true` instead of an error.
//! - **Fallback tagging**: runs that ended failed, timed out or cancelled (or
//!   whose trigger was answered from cache) carry the last cached
//!   [`FallbackRecord`](crate::models::FallbackRecord) with `fallback = true`.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::engine::storage::RelayStorage;
use crate::models::{AgentStatusView, DataSource, StatusSnapshot, WorkflowRun, WorkflowStatus};
use crate::{RelayError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct PollingPolicy {
    pub max_attempts: u32,
    pub max_duration: Duration,
    pub base_interval: Duration,
    pub max_interval: Duration,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 120,
            max_duration: Duration::from_secs(1800),
            base_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
        }
    }
}

impl PollingPolicy {
    pub fn should_continue(&self, status: WorkflowStatus, attempt: u32, elapsed: Duration) -> bool {
        !status.is_terminal() && attempt < self.max_attempts && elapsed < self.max_duration
    }

    /// Interval doubles every ten polls, capped at `max_interval`
    pub fn next_interval(&self, attempt: u32) -> Duration {
        let doublings = (attempt / 10).min(16);
        self.base_interval
            .saturating_mul(1u32 << doublings)
            .min(self.max_interval)
    }
}

pub struct StatusQuery {
    storage: Arc<dyn RelayStorage>,
    policy: PollingPolicy,
    poll_counts: DashMap<Uuid, u32>,
    last_known: DashMap<Uuid, StatusSnapshot>,
}

impl StatusQuery {
    pub fn new(storage: Arc<dyn RelayStorage>, policy: PollingPolicy) -> Self {
        Self {
            storage,
            policy,
            poll_counts: DashMap::new(),
            last_known: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &PollingPolicy {
        &self.policy
    }

    /// Snapshot for one poll; counts toward the run's polling budget
    ///
    /// Only polls of existing runs are counted. Bookkeeping for a run is
    /// dropped once it is seen terminal.
    pub async fn status(&self, workflow_run_id: Uuid) -> Result<StatusSnapshot> {
        let run = match self.storage.get_run(&workflow_run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                return Err(RelayError::NotFound(format!("workflow run {}", workflow_run_id)))
            }
            Err(error) => return self.stale(workflow_run_id, error),
        };

        let terminal = run.is_terminal();
        let attempt = self.next_attempt(workflow_run_id, terminal);
        match self.live_snapshot(run, attempt).await {
            Ok(snapshot) => {
                if terminal {
                    self.last_known.remove(&workflow_run_id);
                } else {
                    self.last_known.insert(workflow_run_id, snapshot.clone());
                }
                Ok(snapshot)
            }
            Err(error) => self.stale_at(workflow_run_id, attempt, error),
        }
    }

    fn next_attempt(&self, workflow_run_id: Uuid, terminal: bool) -> u32 {
        if terminal {
            return self
                .poll_counts
                .remove(&workflow_run_id)
                .map_or(0, |(_, count)| count)
                + 1;
        }
        let mut count = self.poll_counts.entry(workflow_run_id).or_insert(0);
        *count += 1;
        *count
    }

    /// Storage failed before the run was read; counts only runs served before
    fn stale(&self, workflow_run_id: Uuid, error: RelayError) -> Result<StatusSnapshot> {
        if !self.last_known.contains_key(&workflow_run_id) {
            return Err(error);
        }
        let attempt = self.next_attempt(workflow_run_id, false);
        self.stale_at(workflow_run_id, attempt, error)
    }

    fn stale_at(&self, workflow_run_id: Uuid, attempt: u32, error: RelayError) -> Result<StatusSnapshot> {
        let Some(mut cached) = self
            .last_known
            .get(&workflow_run_id)
            .map(|entry| entry.value().clone())
        else {
            return Err(error);
        };
        warn!(
            workflow_run_id = %workflow_run_id,
            error = %error,
            "Live status unavailable, serving stale snapshot"
        );
        // Without a live started_at, only the attempt bound applies
        cached.stale = true;
        cached.poll_attempt = attempt;
        cached.should_continue_polling = cached.should_continue_polling
            && self.policy.should_continue(cached.status, attempt, Duration::ZERO);
        cached.next_poll_interval_ms = if cached.should_continue_polling {
            self.policy.next_interval(attempt).as_millis() as u64
        } else {
            0
        };
        Ok(cached)
    }

    async fn live_snapshot(&self, run: WorkflowRun, attempt: u32) -> Result<StatusSnapshot> {
        let agents = self.storage.list_agents(&run.id).await?;

        let elapsed = (Utc::now() - run.started_at).to_std().unwrap_or_default();
        let should_continue_polling = self.policy.should_continue(run.status, attempt, elapsed);
        let next_poll_interval_ms = if should_continue_polling {
            self.policy.next_interval(attempt).as_millis() as u64
        } else {
            0
        };

        let fallback_data = if needs_fallback(&run) {
            self.storage
                .get_fallback(&run.id.to_string())
                .await?
                .filter(|record| !record.is_expired(Utc::now()))
                .map(|record| record.payload)
        } else {
            None
        };

        Ok(StatusSnapshot {
            workflow_run_id: run.id,
            correlation_id: run.correlation_id.clone(),
            status: run.status,
            progress_percent: run.progress_percent,
            agents: agents.iter().map(AgentStatusView::from).collect(),
            should_continue_polling,
            next_poll_interval_ms,
            poll_attempt: attempt,
            stale: false,
            fallback: fallback_data.is_some(),
            fallback_data,
            error_message: run.error_message.clone(),
        })
    }
}

fn needs_fallback(run: &WorkflowRun) -> bool {
    matches!(
        run.status,
        WorkflowStatus::Failed | WorkflowStatus::Timeout | WorkflowStatus::Cancelled
    ) || run.dispatch_source == Some(DataSource::Fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use crate::models::{
        AgentExecution, AgentId, FallbackRecord, TriggerSource, WebhookEvent,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Delegates to memory, but can be told to fail reads
    #[derive(Default)]
    struct FlakyStorage {
        inner: InMemoryStorage,
        down: AtomicBool,
    }

    impl FlakyStorage {
        fn check(&self) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(RelayError::Storage(anyhow::anyhow!("connection refused")));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl RelayStorage for FlakyStorage {
        async fn create_run(&self, run: WorkflowRun) -> Result<WorkflowRun> {
            self.inner.create_run(run).await
        }
        async fn get_run(&self, id: &Uuid) -> Result<Option<WorkflowRun>> {
            self.check()?;
            self.inner.get_run(id).await
        }
        async fn update_run(&self, run: WorkflowRun) -> Result<WorkflowRun> {
            self.inner.update_run(run).await
        }
        async fn list_active_runs(&self) -> Result<Vec<WorkflowRun>> {
            self.inner.list_active_runs().await
        }
        async fn upsert_agent(&self, execution: AgentExecution) -> Result<AgentExecution> {
            self.inner.upsert_agent(execution).await
        }
        async fn get_agent(&self, run_id: &Uuid, agent_id: &AgentId) -> Result<Option<AgentExecution>> {
            self.inner.get_agent(run_id, agent_id).await
        }
        async fn list_agents(&self, run_id: &Uuid) -> Result<Vec<AgentExecution>> {
            self.check()?;
            self.inner.list_agents(run_id).await
        }
        async fn append_webhook_event(&self, event: WebhookEvent) -> Result<()> {
            self.inner.append_webhook_event(event).await
        }
        async fn find_processed_event(&self, dedup_hash: &str) -> Result<Option<WebhookEvent>> {
            self.inner.find_processed_event(dedup_hash).await
        }
        async fn list_webhook_events(&self, run_id: &Uuid) -> Result<Vec<WebhookEvent>> {
            self.inner.list_webhook_events(run_id).await
        }
        async fn put_fallback(&self, record: FallbackRecord) -> Result<()> {
            self.inner.put_fallback(record).await
        }
        async fn get_fallback(&self, key: &str) -> Result<Option<FallbackRecord>> {
            self.inner.get_fallback(key).await
        }
    }

    async fn seeded(storage: &dyn RelayStorage) -> WorkflowRun {
        let run = WorkflowRun::new("s1", "quick", TriggerSource::Api, json!({}), 1);
        storage.create_run(run.clone()).await.unwrap();
        storage
            .upsert_agent(AgentExecution::new(run.id, &crate::models::AgentSpec::new("A1")))
            .await
            .unwrap();
        run
    }

    #[test]
    fn test_interval_grows_and_caps() {
        let policy = PollingPolicy::default();
        assert_eq!(policy.next_interval(1), Duration::from_secs(2));
        assert_eq!(policy.next_interval(10), Duration::from_secs(4));
        assert_eq!(policy.next_interval(100), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_polling_stops_after_max_attempts() {
        let storage = Arc::new(InMemoryStorage::new());
        let run = seeded(storage.as_ref()).await;
        let query = StatusQuery::new(
            storage,
            PollingPolicy {
                max_attempts: 3,
                ..PollingPolicy::default()
            },
        );

        let first = query.status(run.id).await.unwrap();
        assert!(first.should_continue_polling);
        assert_eq!(first.next_poll_interval_ms, 2000);
        assert_eq!(first.agents.len(), 1);
        query.status(run.id).await.unwrap();
        let third = query.status(run.id).await.unwrap();
        assert!(!third.should_continue_polling);
        assert_eq!(third.next_poll_interval_ms, 0);
    }

    #[tokio::test]
    async fn test_polling_stops_after_max_duration() {
        let storage = Arc::new(InMemoryStorage::new());
        let mut run = seeded(storage.as_ref()).await;
        run.started_at = Utc::now() - chrono::Duration::minutes(31);
        storage.update_run(run.clone()).await.unwrap();

        let query = StatusQuery::new(storage, PollingPolicy::default());
        assert!(!query.status(run.id).await.unwrap().should_continue_polling);
    }

    #[tokio::test]
    async fn test_failed_run_carries_fallback() {
        let storage = Arc::new(InMemoryStorage::new());
        let mut run = seeded(storage.as_ref()).await;
        run.finish(WorkflowStatus::Failed, Some("A1 timed out".into()));
        storage.update_run(run.clone()).await.unwrap();
        storage
            .put_fallback(FallbackRecord::new(
                run.id.to_string(),
                json!({"results": {}}),
                chrono::Duration::hours(1),
            ))
            .await
            .unwrap();

        let query = StatusQuery::new(storage, PollingPolicy::default());
        let snapshot = query.status(run.id).await.unwrap();
        assert!(snapshot.fallback);
        assert_eq!(snapshot.fallback_data, Some(json!({"results": {}})));
        assert!(!snapshot.should_continue_polling);
        assert_eq!(snapshot.error_message.as_deref(), Some("A1 timed out"));
    }

    #[tokio::test]
    async fn test_storage_outage_serves_stale_snapshot() {
        let storage = Arc::new(FlakyStorage::default());
        let run = seeded(storage.as_ref()).await;
        let query = StatusQuery::new(storage.clone(), PollingPolicy::default());

        let live = query.status(run.id).await.unwrap();
        assert!(!live.stale);

        storage.down.store(true, Ordering::SeqCst);
        let stale = query.status(run.id).await.unwrap();
        assert!(stale.stale);
        assert_eq!(stale.status, live.status);
        assert_eq!(stale.poll_attempt, 2);

        let never_seen = query.status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(never_seen, RelayError::Storage(_)));
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let query = StatusQuery::new(Arc::new(InMemoryStorage::new()), PollingPolicy::default());
        for _ in 0..5 {
            let err = query.status(Uuid::new_v4()).await.unwrap_err();
            assert!(matches!(err, RelayError::NotFound(_)));
        }
        assert!(query.poll_counts.is_empty());
        assert!(query.last_known.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_run_drops_poll_bookkeeping() {
        let storage = Arc::new(InMemoryStorage::new());
        let mut run = seeded(storage.as_ref()).await;
        let query = StatusQuery::new(storage.clone(), PollingPolicy::default());

        query.status(run.id).await.unwrap();
        query.status(run.id).await.unwrap();
        assert_eq!(query.poll_counts.get(&run.id).map(|c| *c), Some(2));
        assert!(query.last_known.contains_key(&run.id));

        run.finish(WorkflowStatus::Completed, None);
        storage.update_run(run.clone()).await.unwrap();
        let last = query.status(run.id).await.unwrap();
        assert_eq!(last.poll_attempt, 3);
        assert!(!last.should_continue_polling);
        assert!(!query.poll_counts.contains_key(&run.id));
        assert!(!query.last_known.contains_key(&run.id));
    }
}
