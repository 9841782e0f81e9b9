// End-to-end tests of the relay HTTP API
use crate::config::RelayConfig;
use crate::engine::invoker::tests::ScriptedEndpoint;
use crate::engine::retry::CallError;
use crate::server::{RelayServer, RelayServerBuilder};

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

const PLATFORM: &str = "agent-platform";

const QUICK_AGENTS: [&str; 9] = [
    "intake",
    "profile",
    "enrichment",
    "classification",
    "risk",
    "compliance",
    "pricing",
    "summary",
    "notification",
];

struct TestApp {
    server: RelayServer,
    router: Router,
    platform: Arc<ScriptedEndpoint>,
}

fn test_app() -> TestApp {
    let mut config = RelayConfig::default().with_webhook_secret("test-secret");
    config.tracker.max_agent_retries = 0;
    let platform = Arc::new(ScriptedEndpoint::new(PLATFORM));
    let server = RelayServerBuilder::new()
        .with_config(config)
        .with_endpoint(platform.clone())
        .build()
        .unwrap();
    let router = server.router();
    TestApp {
        server,
        router,
        platform,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

impl TestApp {
    async fn trigger(&self, session_id: &str) -> (StatusCode, Value) {
        send(
            &self.router,
            json_request(
                Method::POST,
                "/api/v1/workflows",
                json!({"sessionId": session_id, "scope": "quick"}),
            ),
        )
        .await
    }

    /// Triggers a run and waits for the background dispatch to land
    async fn start_run(&self, session_id: &str) -> Uuid {
        let (status, body) = self.trigger(session_id).await;
        assert_eq!(status, StatusCode::ACCEPTED, "{}", body);
        let run_id: Uuid = serde_json::from_value(body["workflowRunId"].clone()).unwrap();

        for _ in 0..200 {
            let run = self.server.state().storage.get_run(&run_id).await.unwrap().unwrap();
            if run.dispatch_source.is_some() {
                return run_id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} was never dispatched", run_id);
    }

    fn signed_webhook(&self, body: &Value) -> Request<Body> {
        let raw = body.to_string();
        let headers = self
            .server
            .state()
            .pipeline
            .verifier()
            .sign_headers(Utc::now().timestamp(), raw.as_bytes())
            .unwrap();
        Request::builder()
            .method(Method::POST)
            .uri("/api/v1/webhooks")
            .header("content-type", "application/json")
            .header("x-relay-signature", headers.signature.unwrap())
            .header("x-relay-timestamp", headers.timestamp.unwrap())
            .body(Body::from(raw))
            .unwrap()
    }

    async fn webhook(&self, body: &Value) -> (StatusCode, Value) {
        send(&self.router, self.signed_webhook(body)).await
    }

    async fn status(&self, run_id: Uuid) -> Value {
        let (status, body) = send(
            &self.router,
            get(&format!("/api/v1/workflows/{}/status", run_id)),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        body
    }
}

fn agent_event(event_type: &str, run_id: Uuid, agent: &str, offset: u64, payload: Value) -> Value {
    json!({
        "eventType": event_type,
        "workflowRunId": run_id,
        "agentId": agent,
        "sequenceOffset": offset,
        "payload": payload,
    })
}

#[tokio::test]
async fn test_quick_scope_run_from_trigger_to_timeout_fallback() {
    let app = test_app();
    let run_id = app.start_run("session-e2e").await;
    assert_eq!(app.platform.calls(), 1);

    let (status, ack) = app
        .webhook(&agent_event("agent_started", run_id, "intake", 1, json!({})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "applied");

    let snapshot = app.status(run_id).await;
    assert_eq!(snapshot["status"], "in_progress");
    assert_eq!(snapshot["progressPercent"], 0.0);
    assert_eq!(snapshot["shouldContinuePolling"], true);

    let completed = agent_event("agent_completed", run_id, "intake", 2, json!({"score": 7}));
    let (status, first_ack) = app.webhook(&completed).await;
    assert_eq!(status, StatusCode::OK);
    let snapshot = app.status(run_id).await;
    assert_eq!(snapshot["progressPercent"], 11.11);

    let (status, redelivered_ack) = app.webhook(&completed).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(redelivered_ack, first_ack);
    assert_eq!(app.status(run_id).await["progressPercent"], 11.11);

    for agent in &QUICK_AGENTS[1..] {
        let (status, _) = app
            .webhook(&agent_event("agent_started", run_id, agent, 1, json!({})))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let report = app
        .server
        .tracker()
        .sweep_timeouts(Utc::now() + chrono::Duration::minutes(11))
        .await
        .unwrap();
    assert_eq!(report.timed_out_agents.len(), 8);

    let snapshot = app.status(run_id).await;
    assert_eq!(snapshot["status"], "failed");
    assert_eq!(snapshot["fallback"], true);
    assert_eq!(snapshot["shouldContinuePolling"], false);
    assert_eq!(snapshot["fallbackData"]["results"]["intake"]["score"], 7);

    // Session is free again once the run is terminal
    let (status, _) = app.trigger("session-e2e").await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, audit) = send(
        &app.router,
        get(&format!("/api/v1/workflows/{}/webhooks", run_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let records = audit.as_array().unwrap();
    assert_eq!(records.len(), 11);
    assert_eq!(
        records.iter().filter(|r| !r["duplicateOf"].is_null()).count(),
        1
    );
}

#[tokio::test]
async fn test_second_trigger_for_same_session_conflicts() {
    let app = test_app();
    let run_id = app.start_run("s1").await;

    let (status, body) = app.trigger("s1").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "concurrent_trigger_error");
    assert_eq!(body["error"]["activeRunId"], json!(run_id));
    assert!(body["error"]["correlationId"].as_str().unwrap().starts_with("corr-"));

    let (status, body) = send(
        &app.router,
        Request::builder()
            .method(Method::DELETE)
            .uri(format!("/api/v1/workflows/{}", run_id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    let (status, _) = app.trigger("s1").await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_invalid_trigger_bodies_are_rejected() {
    let app = test_app();

    let (status, body) = send(
        &app.router,
        json_request(Method::POST, "/api/v1/workflows", json!({"sessionId": "s1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "validation_error");
    assert!(body["error"]["correlationId"].as_str().unwrap().starts_with("corr-"));

    let mut unknown_scope = json_request(
        Method::POST,
        "/api/v1/workflows",
        json!({"sessionId": "s1", "scope": "exhaustive"}),
    );
    unknown_scope
        .headers_mut()
        .insert("x-correlation-id", "client-42".parse().unwrap());
    let (status, body) = send(&app.router, unknown_scope).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["correlationId"], "client-42");
    assert_eq!(app.platform.calls(), 0);
}

#[tokio::test]
async fn test_caller_correlation_id_is_kept_on_the_run() {
    let app = test_app();
    let mut request = json_request(
        Method::POST,
        "/api/v1/workflows",
        json!({"sessionId": "s1", "scope": "quick"}),
    );
    request
        .headers_mut()
        .insert("x-correlation-id", "client-7".parse().unwrap());
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["correlationId"], "client-7");
}

#[tokio::test]
async fn test_webhook_with_bad_signature_is_unauthorized() {
    let app = test_app();
    let run_id = app.start_run("s1").await;

    let body = agent_event("agent_started", run_id, "intake", 1, json!({}));
    let mut request = app.signed_webhook(&body);
    request
        .headers_mut()
        .insert("x-relay-signature", "deadbeef".parse().unwrap());
    let (status, response) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"]["type"], "authentication_error");
    let run = app.server.state().storage.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(response["error"]["correlationId"], json!(run.correlation_id));

    let unsigned = json_request(Method::POST, "/api/v1/webhooks", body);
    let (status, response) = send(&app.router, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"]["correlationId"], json!(run.correlation_id));

    assert_eq!(app.status(run_id).await["status"], "initiated");
}

#[tokio::test]
async fn test_unknown_runs_and_bad_ids() {
    let app = test_app();

    let (status, body) = send(
        &app.router,
        get(&format!("/api/v1/workflows/{}/status", Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "not_found");

    let (status, _) = send(&app.router, get("/api/v1/workflows/not-a-uuid/status")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app.router, get("/api/v1/nowhere")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_event_stream_replays_finished_run() {
    let app = test_app();
    let run_id = app.start_run("s1").await;
    for (offset, event_type) in [(1, "agent_started"), (2, "agent_completed")] {
        app.webhook(&agent_event(event_type, run_id, "intake", offset, json!({"ok": true})))
            .await;
    }
    app.webhook(&json!({"eventType": "workflow_completed", "workflowRunId": run_id}))
        .await;

    let response = app
        .router
        .clone()
        .oneshot(get(&format!("/api/v1/workflows/{}/events?after=0", run_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text
        .lines()
        .any(|line| line.starts_with("id:") && line["id:".len()..].trim() == "1"));
    assert!(text.contains("event: agent_transitioned"));
    assert!(text.contains("event: workflow_status_changed"));
}

#[tokio::test]
async fn test_breakers_are_listed_and_reset() {
    let app = test_app();
    app.platform.push(Err(CallError::Client {
        status: 422,
        message: "rejected".into(),
    }));
    let (status, _) = app.trigger("s1").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    for _ in 0..200 {
        if app.platform.calls() == 1 && !app.server.state().invoker.breakers().snapshots().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (status, body) = send(&app.router, get("/api/v1/breakers")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], PLATFORM);
    assert_eq!(body[0]["state"], "CLOSED");

    let (status, body) = send(
        &app.router,
        json_request(
            Method::POST,
            &format!("/api/v1/breakers/{}/reset", PLATFORM),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reset"], true);

    let (status, _) = send(
        &app.router,
        json_request(Method::POST, "/api/v1/breakers/unknown/reset", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, health) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["openBreakers"], 0);
}
