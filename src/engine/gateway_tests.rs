// Tests for the trigger gateway and the retry worker
use super::*;
use crate::engine::alerts::TracingAlertSink;
use crate::engine::invoker::tests::{test_config, ScriptedEndpoint};
use crate::engine::retry::CallError;
use crate::engine::storage::InMemoryStorage;
use crate::engine::stream::EventStreamPublisher;
use crate::engine::tracker::{AgentUpdate, TrackerConfig};
use crate::models::{AgentId, AgentState, DataSource, WorkflowStatus};
use std::time::Duration;

struct Harness {
    gateway: Arc<TriggerGateway>,
    tracker: Arc<StateTracker>,
    storage: Arc<InMemoryStorage>,
    platform: Arc<ScriptedEndpoint>,
}

fn harness(max_agent_retries: u32) -> Harness {
    let storage = Arc::new(InMemoryStorage::new());
    let sessions = Arc::new(SessionRegistry::new());
    let (retry_tx, retry_rx) = mpsc::unbounded_channel();
    let tracker = Arc::new(
        StateTracker::new(
            TrackerConfig {
                max_agent_retries,
                ..TrackerConfig::default()
            },
            storage.clone(),
            Arc::new(EventStreamPublisher::default()),
            sessions.clone(),
        )
        .with_retry_sender(retry_tx),
    );
    let invoker = Arc::new(ReliabilityInvoker::new(
        test_config(),
        storage.clone(),
        Arc::new(TracingAlertSink),
    ));
    let platform = Arc::new(ScriptedEndpoint::new("platform"));
    invoker.register_endpoint(platform.clone());

    let mut scopes = HashMap::new();
    scopes.insert(
        "quick".to_string(),
        vec![AgentSpec::new("A1"), AgentSpec::new("A2")],
    );
    let gateway = Arc::new(TriggerGateway::new(
        "platform",
        scopes,
        invoker,
        tracker.clone(),
        sessions,
        storage.clone(),
    ));
    gateway.spawn_retry_worker(retry_rx);
    Harness {
        gateway,
        tracker,
        storage,
        platform,
    }
}

/// Polls storage until `check` holds for the run
async fn eventually<F>(storage: &InMemoryStorage, run_id: Uuid, check: F) -> WorkflowRun
where
    F: Fn(&WorkflowRun) -> bool,
{
    for _ in 0..200 {
        if let Some(run) = storage.get_run(&run_id).await.unwrap() {
            if check(&run) {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} never reached the expected state", run_id);
}

async fn agent_state(storage: &InMemoryStorage, run_id: Uuid, agent: &str) -> AgentState {
    storage
        .get_agent(&run_id, &AgentId::from(agent))
        .await
        .unwrap()
        .unwrap()
        .state
}

#[tokio::test]
async fn test_trigger_returns_initiated_run_and_dispatches() {
    let h = harness(0);
    let run = h
        .gateway
        .trigger(TriggerRequest::new("s1", "quick"))
        .await
        .unwrap();
    assert_eq!(run.status, WorkflowStatus::Initiated);
    assert_eq!(run.scheduled_agent_count, 2);

    let dispatched = eventually(&h.storage, run.id, |r| r.dispatch_source.is_some()).await;
    assert_eq!(dispatched.dispatch_source, Some(DataSource::Live));
    assert_eq!(agent_state(&h.storage, run.id, "A1").await, AgentState::Starting);
    assert_eq!(h.platform.calls(), 1);
}

#[tokio::test]
async fn test_second_trigger_for_active_session_is_rejected() {
    let h = harness(0);
    let first = h
        .gateway
        .trigger(TriggerRequest::new("s1", "quick"))
        .await
        .unwrap();

    match h.gateway.trigger(TriggerRequest::new("s1", "quick")).await {
        Err(RelayError::ConcurrentTrigger { active_run_id, .. }) => assert_eq!(active_run_id, first.id),
        other => panic!("expected concurrent trigger error, got {:?}", other.map(|r| r.id)),
    }
    h.gateway
        .trigger(TriggerRequest::new("s2", "quick"))
        .await
        .unwrap();

    h.gateway.cancel(first.id).await.unwrap();
    h.gateway
        .trigger(TriggerRequest::new("s1", "quick"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_invalid_requests_fail_before_any_call() {
    let h = harness(0);
    let unknown = h
        .gateway
        .trigger(TriggerRequest::new("s1", "exhaustive"))
        .await
        .unwrap_err();
    assert!(matches!(unknown, RelayError::Validation(_)));

    let blank = h
        .gateway
        .trigger(TriggerRequest::new("  ", "quick"))
        .await
        .unwrap_err();
    assert!(matches!(blank, RelayError::Validation(_)));
    assert_eq!(h.platform.calls(), 0);
}

#[tokio::test]
async fn test_missing_platform_endpoint_is_configuration_error() {
    let storage = Arc::new(InMemoryStorage::new());
    let sessions = Arc::new(SessionRegistry::new());
    let tracker = Arc::new(StateTracker::new(
        TrackerConfig::default(),
        storage.clone(),
        Arc::new(EventStreamPublisher::default()),
        sessions.clone(),
    ));
    let invoker = Arc::new(ReliabilityInvoker::new(
        test_config(),
        storage.clone(),
        Arc::new(TracingAlertSink),
    ));
    let mut scopes = HashMap::new();
    scopes.insert("quick".to_string(), vec![AgentSpec::new("A1")]);
    let gateway = Arc::new(TriggerGateway::new(
        "platform", scopes, invoker, tracker, sessions.clone(), storage,
    ));

    let err = gateway
        .trigger(TriggerRequest::new("s1", "quick"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Configuration(_)));
    assert!(sessions.active_run("s1").is_none());
}

#[tokio::test]
async fn test_rejected_dispatch_fails_run_and_releases_session() {
    let h = harness(0);
    h.platform.push(Err(CallError::Client {
        status: 422,
        message: "scope disabled".into(),
    }));
    let run = h
        .gateway
        .trigger(TriggerRequest::new("s1", "quick"))
        .await
        .unwrap();

    let failed = eventually(&h.storage, run.id, |r| r.is_terminal()).await;
    assert_eq!(failed.status, WorkflowStatus::Failed);
    assert!(failed.error_message.unwrap().contains("scope disabled"));
    assert!(h.gateway.sessions().active_run("s1").is_none());
}

#[tokio::test]
async fn test_failed_agent_is_redispatched_by_worker() {
    let h = harness(1);
    let run = h
        .gateway
        .trigger(TriggerRequest::new("s1", "quick"))
        .await
        .unwrap();
    eventually(&h.storage, run.id, |r| r.dispatch_source.is_some()).await;

    h.tracker
        .apply_agent_event(run.id, &"A1".into(), AgentUpdate::failed(1, "worker crashed"))
        .await
        .unwrap();

    for _ in 0..200 {
        if agent_state(&h.storage, run.id, "A1").await == AgentState::Starting {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(agent_state(&h.storage, run.id, "A1").await, AgentState::Starting);
    assert_eq!(h.platform.calls(), 2);

    let agent = h
        .storage
        .get_agent(&run.id, &AgentId::from("A1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(agent.retry_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_triggers_store_one_run() {
    let h = harness(0);
    let barrier = Arc::new(tokio::sync::Barrier::new(2));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let gateway = h.gateway.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            gateway.trigger(TriggerRequest::new("s1", "quick")).await
        }));
    }
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    let winners: Vec<&WorkflowRun> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let rejected = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    match rejected {
        RelayError::ConcurrentTrigger { active_run_id, .. } => assert_eq!(*active_run_id, winners[0].id),
        other => panic!("expected concurrent trigger error, got {:?}", other),
    }

    let stored: Vec<WorkflowRun> = h
        .storage
        .list_active_runs()
        .await
        .unwrap()
        .into_iter()
        .filter(|run| run.session_id == "s1")
        .collect();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, winners[0].id);
}
