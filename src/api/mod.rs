// Relay HTTP API module
// REST endpoints for triggering, polling, cancelling and streaming workflow runs,
// plus the webhook intake the agent platform calls back into

//! # HTTP API
//!
//! | Method | Path                                  | Handler                    |
//! |--------|---------------------------------------|----------------------------|
//! | POST   | `/api/v1/workflows`                   | [`handlers::trigger_workflow`] |
//! | GET    | `/api/v1/workflows/:id/status`        | [`handlers::workflow_status`] |
//! | DELETE | `/api/v1/workflows/:id`               | [`handlers::cancel_workflow`] |
//! | GET    | `/api/v1/workflows/:id/events`        | [`handlers::stream_workflow_events`] (SSE) |
//! | GET    | `/api/v1/workflows/:id/webhooks`      | [`handlers::list_workflow_webhooks`] |
//! | POST   | `/api/v1/webhooks`                    | [`handlers::receive_webhook`] |
//! | GET    | `/api/v1/breakers`                    | [`handlers::list_breakers`] |
//! | POST   | `/api/v1/breakers/:name/reset`        | [`handlers::reset_breaker`] |
//! | GET    | `/health`                             | [`handlers::health_check`] |
//!
//! Every error response has the body
//! `{"error": {"type": ..., "message": ..., "correlationId": ...}}` and the
//! status code of the underlying [`crate::RelayError`].

pub mod handlers;
pub mod types;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use crate::engine::{
    EventStreamPublisher, ReliabilityInvoker, RelayStorage, StatusQuery, TriggerGateway,
    WebhookPipeline,
};
use handlers::{
    cancel_workflow, health_check, list_breakers, list_workflow_webhooks, not_found,
    receive_webhook, reset_breaker, stream_workflow_events, trigger_workflow, workflow_status,
};

/// Engines shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<TriggerGateway>,
    pub pipeline: Arc<WebhookPipeline>,
    pub status: Arc<StatusQuery>,
    pub publisher: Arc<EventStreamPublisher>,
    pub invoker: Arc<ReliabilityInvoker>,
    pub storage: Arc<dyn RelayStorage>,
}

/// Builds the relay router; layers (CORS, tracing) are added by the server
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/workflows", post(trigger_workflow))
        .route("/api/v1/workflows/:id", delete(cancel_workflow))
        .route("/api/v1/workflows/:id/status", get(workflow_status))
        .route("/api/v1/workflows/:id/events", get(stream_workflow_events))
        .route("/api/v1/workflows/:id/webhooks", get(list_workflow_webhooks))
        .route("/api/v1/webhooks", post(receive_webhook))
        .route("/api/v1/breakers", get(list_breakers))
        .route("/api/v1/breakers/:name/reset", post(reset_breaker))
        .route("/health", get(health_check))
        .fallback(not_found)
        .with_state(state)
}

#[cfg(test)]
mod tests;
