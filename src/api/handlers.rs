// Relay HTTP handlers
// Thin adapters from axum extractors to the engine layer

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
    Json,
};
use futures::{future, stream::BoxStream, StreamExt};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::types::{
    ApiError, ApiResult, BreakerResetResponse, CancelResponse, EventsQuery, TriggerResponse,
};
use crate::api::AppState;
use crate::engine::gateway::TriggerRequest;
use crate::engine::webhooks::{WebhookHeaders, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::models::{
    new_correlation_id, AckResponse, BreakerPhase, CircuitBreakerState, StateChange,
    StateChangeEvent, StatusSnapshot, WebhookEnvelope, WebhookEvent, WorkflowRun,
};
use crate::RelayError;

const LAST_EVENT_ID: &str = "last-event-id";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

fn parse_run_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| RelayError::Validation(format!("'{}' is not a workflow run id", raw)).into())
}

async fn load_run(state: &AppState, run_id: Uuid) -> ApiResult<WorkflowRun> {
    state
        .storage
        .get_run(&run_id)
        .await?
        .ok_or_else(|| RelayError::NotFound(format!("workflow run {}", run_id)).into())
}

/// POST /api/v1/workflows
///
/// The correlation id is fixed before validation, so rejected triggers carry
/// one too. A caller-supplied `x-correlation-id` is kept.
pub async fn trigger_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Result<Json<TriggerRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_correlation_id);
    let Json(request) = request.map_err(|rejection| {
        ApiError::from(RelayError::Validation(rejection.body_text())).with_correlation(&correlation_id)
    })?;
    info!(
        scope = %request.scope,
        session_id = ?request.session_id,
        correlation_id = %correlation_id,
        "📨 POST /api/v1/workflows"
    );

    let run = state
        .gateway
        .trigger(request.with_correlation_id(&correlation_id))
        .await
        .map_err(|e| ApiError::from(e).with_correlation(&correlation_id))?;
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse::from(&run))))
}

/// GET /api/v1/workflows/:id/status
pub async fn workflow_status(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<StatusSnapshot>> {
    let run_id = parse_run_id(&raw_id)?;
    let snapshot = state.status.status(run_id).await?;
    debug!(
        workflow_run_id = %run_id,
        status = %snapshot.status,
        progress = snapshot.progress_percent,
        poll_attempt = snapshot.poll_attempt,
        "Status polled"
    );
    Ok(Json(snapshot))
}

/// DELETE /api/v1/workflows/:id
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let run_id = parse_run_id(&raw_id)?;
    let run = state.gateway.cancel(run_id).await?;
    Ok(Json(CancelResponse {
        workflow_run_id: run.id,
        status: run.status,
        progress_percent: run.progress_percent,
    }))
}

/// GET /api/v1/workflows/:id/events
///
/// Server-sent events, one per state change, with the sequence number as
/// the SSE id. The stream ends after the run's terminal status event.
pub async fn stream_workflow_events(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let run_id = parse_run_id(&raw_id)?;
    let run = load_run(&state, run_id).await?;
    let after = headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .or(query.after)
        .unwrap_or(0);
    info!(workflow_run_id = %run_id, after, "📡 Event stream subscribed");

    let events: BoxStream<'static, StateChangeEvent> = if run.is_terminal() {
        futures::stream::iter(state.publisher.replay(run_id, after)).boxed()
    } else {
        state
            .publisher
            .subscribe(run_id, after)
            .scan(false, |finished, event| {
                if *finished {
                    return future::ready(None);
                }
                *finished = matches!(
                    event.change,
                    StateChange::WorkflowStatusChanged { to, .. } if to.is_terminal()
                );
                future::ready(Some(event))
            })
            .boxed()
    };

    let stream = events.map(|event| {
        Event::default()
            .id(event.sequence.to_string())
            .event(event_name(&event.change))
            .json_data(&event)
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

fn event_name(change: &StateChange) -> &'static str {
    match change {
        StateChange::AgentTransitioned { .. } => "agent_transitioned",
        StateChange::WorkflowStatusChanged { .. } => "workflow_status_changed",
        StateChange::ProgressUpdated { .. } => "progress_updated",
        StateChange::DataReceived { .. } => "data_received",
    }
}

/// GET /api/v1/workflows/:id/webhooks
pub async fn list_workflow_webhooks(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<Vec<WebhookEvent>>> {
    let run_id = parse_run_id(&raw_id)?;
    let run = load_run(&state, run_id).await?;
    let events = state
        .storage
        .list_webhook_events(&run_id)
        .await
        .map_err(|e| ApiError::from(e).with_correlation(run.correlation_id))?;
    Ok(Json(events))
}

/// POST /api/v1/webhooks
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<AckResponse>> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let webhook_headers = WebhookHeaders {
        signature: header(SIGNATURE_HEADER),
        timestamp: header(TIMESTAMP_HEADER),
    };
    match state.pipeline.receive(&webhook_headers, &body).await {
        Ok(ack) => Ok(Json(ack)),
        Err(error) => {
            let correlation_id = webhook_correlation(&state, &body).await;
            Err(ApiError::from(error).with_correlation(correlation_id))
        }
    }
}

/// Correlation id of the run a rejected delivery names, or a fresh one
async fn webhook_correlation(state: &AppState, body: &[u8]) -> String {
    let Some(run_id) = serde_json::from_slice::<WebhookEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.workflow_run_id)
    else {
        return new_correlation_id();
    };
    match state.storage.get_run(&run_id).await {
        Ok(Some(run)) => run.correlation_id,
        _ => run_id.to_string(),
    }
}

/// GET /api/v1/breakers
pub async fn list_breakers(State(state): State<AppState>) -> Json<Vec<CircuitBreakerState>> {
    let mut breakers = state.invoker.breakers().snapshots();
    breakers.sort_by(|a, b| a.name.cmp(&b.name));
    Json(breakers)
}

/// POST /api/v1/breakers/:name/reset
pub async fn reset_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<BreakerResetResponse>> {
    if !state.invoker.breakers().reset(&name) {
        return Err(RelayError::NotFound(format!("circuit breaker '{}'", name)).into());
    }
    info!(endpoint = %name, "🔧 Circuit breaker reset by operator");
    Ok(Json(BreakerResetResponse {
        endpoint: name,
        reset: true,
    }))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let open_breakers = state
        .invoker
        .breakers()
        .snapshots()
        .into_iter()
        .filter(|breaker| breaker.state != BreakerPhase::Closed)
        .count();
    Json(json!({
        "status": "ok",
        "service": "agent-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "activeSessions": state.gateway.sessions().active_count(),
        "openBreakers": open_breakers,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn not_found() -> impl IntoResponse {
    ApiError::from(RelayError::NotFound("route".to_string()))
}
