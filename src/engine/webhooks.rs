// Webhook ingestion pipeline
// Authenticate, deduplicate, persist and apply agent platform callbacks

//! # Webhook Ingestion
//!
//! Every delivery goes through the same steps:
//!
//! 1. **Authenticate**: HMAC-SHA256 over `"{timestamp}.{body}"`, compared in
//!    constant time, with the timestamp inside the replay tolerance
//! 2. **Parse**: the envelope becomes an [`IncomingEvent`]; unknown event
//!    types are acknowledged as `unrecognized` and change nothing
//! 3. **Deduplicate**: identical redeliveries (same dedup hash) get the
//!    original ack back without being re-applied
//! 4. **Apply**: the state tracker applies the event under the per-agent lock
//! 5. **Audit**: every delivery, accepted or not, is appended to storage
//!
//! Steps 4-5 run on a spawned task inside a processing budget. A delivery
//! that overruns it fails with `ProcessingTimeout` so the platform
//! redelivers, but the task still finishes and persists its ack; the
//! redelivery then gets that ack as a duplicate.
//!
//! ## Concurrent Redeliveries
//!
//! Two identical deliveries racing each other share one
//! `tokio::sync::OnceCell` per dedup hash: the first initializes it by
//! applying the event, the second awaits the same cell and receives the same
//! ack. Once initialized the cell is dropped and later redeliveries find the
//! persisted audit record instead.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::storage::RelayStorage;
use crate::engine::tracker::{AgentUpdate, StateTracker};
use crate::models::{
    AckOutcome, AckResponse, AgentId, IncomingEvent, WebhookEnvelope, WebhookEvent, WorkflowStatus,
};
use crate::{RelayError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-relay-signature";
pub const TIMESTAMP_HEADER: &str = "x-relay-timestamp";

/// Authentication headers of one delivery
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebhookHeaders {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub secret: String,
    pub timestamp_tolerance: Duration,
    pub processing_budget: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            timestamp_tolerance: Duration::from_secs(300),
            processing_budget: Duration::from_secs(5),
        }
    }
}

/// HMAC-SHA256 signer/verifier bound to the delivery timestamp
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: impl AsRef<[u8]>, tolerance: Duration) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            tolerance,
        }
    }

    fn mac(&self, timestamp: i64, body: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| RelayError::Configuration(format!("invalid webhook secret: {}", e)))?;
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(body);
        Ok(mac)
    }

    /// Hex signature for `body` sent at `timestamp` (unix seconds)
    pub fn sign(&self, timestamp: i64, body: &[u8]) -> Result<String> {
        Ok(hex::encode(self.mac(timestamp, body)?.finalize().into_bytes()))
    }

    /// Headers a sender attaches to `body`
    pub fn sign_headers(&self, timestamp: i64, body: &[u8]) -> Result<WebhookHeaders> {
        Ok(WebhookHeaders {
            signature: Some(self.sign(timestamp, body)?),
            timestamp: Some(timestamp.to_string()),
        })
    }

    pub fn verify(&self, headers: &WebhookHeaders, body: &[u8], now: DateTime<Utc>) -> Result<()> {
        let signature = headers
            .signature
            .as_deref()
            .ok_or_else(|| RelayError::Authentication(format!("missing {} header", SIGNATURE_HEADER)))?;
        let timestamp: i64 = headers
            .timestamp
            .as_deref()
            .ok_or_else(|| RelayError::Authentication(format!("missing {} header", TIMESTAMP_HEADER)))?
            .trim()
            .parse()
            .map_err(|_| RelayError::Authentication("malformed timestamp".to_string()))?;

        let skew = (now.timestamp() - timestamp).unsigned_abs();
        if skew > self.tolerance.as_secs() {
            return Err(RelayError::Authentication(format!(
                "timestamp outside tolerance ({}s skew)",
                skew
            )));
        }

        let provided = hex::decode(signature.trim().trim_start_matches("sha256="))
            .map_err(|_| RelayError::Authentication("signature is not hex".to_string()))?;
        // verify_slice compares in constant time
        self.mac(timestamp, body)?
            .verify_slice(&provided)
            .map_err(|_| RelayError::Authentication("signature mismatch".to_string()))
    }
}

/// Bookkeeping shared by every audit record of one delivery
#[derive(Clone)]
struct Delivery {
    workflow_run_id: Option<Uuid>,
    agent_id: Option<AgentId>,
    event_type: Option<String>,
    sequence_offset: u64,
    dedup_hash: String,
    received_at: DateTime<Utc>,
    started: Instant,
}

impl Delivery {
    fn new(body: &[u8]) -> Self {
        Self {
            workflow_run_id: None,
            agent_id: None,
            event_type: None,
            sequence_offset: 0,
            dedup_hash: hex::encode(Sha256::digest(body)),
            received_at: Utc::now(),
            started: Instant::now(),
        }
    }

    fn describe(&mut self, envelope: &WebhookEnvelope) {
        self.workflow_run_id = envelope.workflow_run_id;
        self.agent_id = envelope.agent_id.as_deref().map(AgentId::from);
        self.event_type = Some(envelope.event_type.clone());
        self.sequence_offset = envelope.sequence_offset;
        self.dedup_hash = envelope.dedup_hash();
    }

    fn record(
        &self,
        signature_valid: bool,
        http_status: u16,
        outcome: Option<AckOutcome>,
        duplicate_of: Option<Uuid>,
    ) -> WebhookEvent {
        WebhookEvent {
            id: Uuid::new_v4(),
            workflow_run_id: self.workflow_run_id,
            agent_id: self.agent_id.clone(),
            event_type: self.event_type.clone(),
            sequence_offset: self.sequence_offset,
            dedup_hash: self.dedup_hash.clone(),
            signature_valid,
            received_at: self.received_at,
            processing_time_ms: self.started.elapsed().as_millis() as u64,
            http_status,
            outcome,
            duplicate_of,
        }
    }
}

pub struct WebhookPipeline {
    verifier: SignatureVerifier,
    processing_budget: Duration,
    storage: Arc<dyn RelayStorage>,
    tracker: Arc<StateTracker>,
    inflight: DashMap<String, Arc<OnceCell<AckResponse>>>,
}

impl WebhookPipeline {
    pub fn new(config: &WebhookConfig, storage: Arc<dyn RelayStorage>, tracker: Arc<StateTracker>) -> Self {
        Self {
            verifier: SignatureVerifier::new(&config.secret, config.timestamp_tolerance),
            processing_budget: config.processing_budget,
            storage,
            tracker,
            inflight: DashMap::new(),
        }
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    /// Handles one raw delivery and returns the ack to send back
    pub async fn receive(&self, headers: &WebhookHeaders, body: &[u8]) -> Result<AckResponse> {
        let mut delivery = Delivery::new(body);

        if let Err(error) = self.verifier.verify(headers, body, delivery.received_at) {
            warn!(
                security_event = true,
                dedup_hash = %delivery.dedup_hash,
                reason = %error,
                "🔒 Rejected webhook with invalid signature"
            );
            self.audit_rejection(delivery.record(false, error.status_code(), None, None))
                .await;
            return Err(error);
        }

        let parsed = serde_json::from_slice::<WebhookEnvelope>(body)
            .map_err(|e| RelayError::Validation(format!("malformed webhook payload: {}", e)))
            .and_then(|envelope| {
                delivery.describe(&envelope);
                IncomingEvent::from_envelope(&envelope).map(|event| (envelope, event))
            });
        let (envelope, event) = match parsed {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(dedup_hash = %delivery.dedup_hash, error = %error, "Rejected malformed webhook");
                self.audit_rejection(delivery.record(true, error.status_code(), None, None))
                    .await;
                return Err(error);
            }
        };

        let hash = delivery.dedup_hash.clone();
        let cell = self
            .inflight
            .entry(hash.clone())
            .or_default()
            .value()
            .clone();

        let applied_here = AtomicBool::new(false);
        let result = cell
            .get_or_try_init(|| async {
                if let Some(ack) = self
                    .storage
                    .find_processed_event(&hash)
                    .await?
                    .and_then(|previous| previous.ack())
                {
                    return Ok(ack);
                }
                applied_here.store(true, Ordering::Relaxed);
                self.apply_within_budget(&delivery, &envelope, event).await
            })
            .await
            .map(|ack| ack.clone());
        self.inflight
            .remove_if(&hash, |_, current| Arc::ptr_eq(current, &cell));

        let ack = result?;
        if !applied_here.load(Ordering::Relaxed) {
            info!(
                dedup_hash = %hash,
                event_type = %envelope.event_type,
                original_event_id = %ack.event_id,
                "Duplicate webhook acknowledged without reprocessing"
            );
            self.storage
                .append_webhook_event(delivery.record(true, 200, Some(ack.outcome), Some(ack.event_id)))
                .await?;
        }
        Ok(ack)
    }

    /// Runs the apply on its own task and waits at most the budget for it
    ///
    /// The task is never aborted: an overrun answers `ProcessingTimeout`
    /// while the event still lands, and the redelivery finds its ack.
    async fn apply_within_budget(
        &self,
        delivery: &Delivery,
        envelope: &WebhookEnvelope,
        event: IncomingEvent,
    ) -> Result<AckResponse> {
        let handle = tokio::spawn(apply_and_record(
            Arc::clone(&self.tracker),
            Arc::clone(&self.storage),
            delivery.clone(),
            event,
            envelope.event_type.clone(),
        ));

        match tokio::time::timeout(self.processing_budget, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(RelayError::Internal(format!("webhook apply task failed: {}", join))),
            Err(_) => {
                let error = RelayError::ProcessingTimeout {
                    budget_ms: self.processing_budget.as_millis() as u64,
                };
                warn!(
                    event_type = %envelope.event_type,
                    error = %error,
                    "Webhook processing overran its budget; apply continues in the background"
                );
                self.audit_rejection(delivery.record(true, error.status_code(), None, None))
                    .await;
                Err(error)
            }
        }
    }

    async fn audit_rejection(&self, record: WebhookEvent) {
        audit_rejection(self.storage.as_ref(), record).await;
    }
}

/// Applies one event and persists its accepted audit record
async fn apply_and_record(
    tracker: Arc<StateTracker>,
    storage: Arc<dyn RelayStorage>,
    delivery: Delivery,
    event: IncomingEvent,
    event_type: String,
) -> Result<AckResponse> {
    let outcome = match apply_event(&tracker, event, delivery.sequence_offset).await {
        Ok(outcome) => outcome,
        Err(error) => {
            warn!(
                event_type = %event_type,
                workflow_run_id = ?delivery.workflow_run_id,
                error = %error,
                "Webhook could not be applied"
            );
            audit_rejection(
                storage.as_ref(),
                delivery.record(true, error.status_code(), None, None),
            )
            .await;
            return Err(error);
        }
    };

    let record = delivery.record(true, 200, Some(outcome), None);
    let ack = AckResponse {
        ack: true,
        event_id: record.id,
        outcome,
    };
    storage.append_webhook_event(record).await?;
    debug!(
        event_type = %event_type,
        workflow_run_id = ?delivery.workflow_run_id,
        agent_id = ?delivery.agent_id,
        outcome = ?outcome,
        processing_ms = delivery.started.elapsed().as_millis() as u64,
        "Webhook applied"
    );
    Ok(ack)
}

async fn apply_event(tracker: &StateTracker, event: IncomingEvent, offset: u64) -> Result<AckOutcome> {
    match event {
        IncomingEvent::AgentStarted {
            workflow_run_id,
            agent_id,
        } => {
            tracker
                .apply_agent_event(workflow_run_id, &agent_id, AgentUpdate::started(offset))
                .await
        }
        IncomingEvent::AgentCompleted {
            workflow_run_id,
            agent_id,
            result,
        } => {
            tracker
                .apply_agent_event(workflow_run_id, &agent_id, AgentUpdate::completed(offset, result))
                .await
        }
        IncomingEvent::AgentFailed {
            workflow_run_id,
            agent_id,
            error,
        } => {
            tracker
                .apply_agent_event(workflow_run_id, &agent_id, AgentUpdate::failed(offset, error))
                .await
        }
        IncomingEvent::WorkflowCompleted { workflow_run_id } => {
            tracker
                .apply_workflow_outcome(workflow_run_id, WorkflowStatus::Completed, None)
                .await
        }
        IncomingEvent::WorkflowFailed {
            workflow_run_id,
            error,
        } => {
            tracker
                .apply_workflow_outcome(workflow_run_id, WorkflowStatus::Failed, Some(error))
                .await
        }
        IncomingEvent::DataReceived {
            workflow_run_id,
            agent_id,
            data,
        } => tracker.record_data(workflow_run_id, agent_id, data).await,
        IncomingEvent::Unknown { event_type } => {
            warn!(event_type = %event_type, "Unrecognized webhook event type acknowledged");
            Ok(AckOutcome::Unrecognized)
        }
    }
}

async fn audit_rejection(storage: &dyn RelayStorage, record: WebhookEvent) {
    if let Err(e) = storage.append_webhook_event(record).await {
        warn!(error = %e, "Failed to persist webhook audit record");
    }
}

#[cfg(test)]
#[path = "webhooks_tests.rs"]
mod tests;
