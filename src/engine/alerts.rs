// Alert emission for degraded outbound calls

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, warn};
use uuid::Uuid;

use crate::models::BreakerPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Why an alert was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertReason {
    RetriesExhausted,
    CircuitOpen,
    ServedFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub endpoint: String,
    pub correlation_id: String,
    pub severity: AlertSeverity,
    pub reason: AlertReason,
    pub message: String,
    pub breaker_state: BreakerPhase,
    pub attempts: u32,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        endpoint: &str,
        correlation_id: &str,
        reason: AlertReason,
        message: impl Into<String>,
        breaker_state: BreakerPhase,
        attempts: u32,
    ) -> Self {
        let severity = match (reason, breaker_state) {
            (_, BreakerPhase::Open) => AlertSeverity::Critical,
            (AlertReason::RetriesExhausted, _) => AlertSeverity::Critical,
            _ => AlertSeverity::Warning,
        };
        Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.to_string(),
            correlation_id: correlation_id.to_string(),
            severity,
            reason,
            message: message.into(),
            breaker_state,
            attempts,
            raised_at: Utc::now(),
        }
    }
}

/// Destination for alerts raised by the reliability invoker
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: Alert);
}

/// Writes alerts to the log
#[derive(Debug, Default, Clone)]
pub struct TracingAlertSink;

#[async_trait::async_trait]
impl AlertSink for TracingAlertSink {
    async fn emit(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Critical => error!(
                endpoint = %alert.endpoint,
                correlation_id = %alert.correlation_id,
                breaker_state = %alert.breaker_state,
                attempts = alert.attempts,
                reason = ?alert.reason,
                "🚨 {}", alert.message
            ),
            AlertSeverity::Warning => warn!(
                endpoint = %alert.endpoint,
                correlation_id = %alert.correlation_id,
                breaker_state = %alert.breaker_state,
                attempts = alert.attempts,
                reason = ?alert.reason,
                "⚠️  {}", alert.message
            ),
        }
    }
}

/// Logs alerts and fans them out to subscribers
#[derive(Debug, Clone)]
pub struct BroadcastAlertSink {
    sender: broadcast::Sender<Alert>,
}

impl BroadcastAlertSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastAlertSink {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait::async_trait]
impl AlertSink for BroadcastAlertSink {
    async fn emit(&self, alert: Alert) {
        TracingAlertSink.emit(alert.clone()).await;
        // No subscribers is fine
        let _ = self.sender.send(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_sink_delivers() {
        let sink = BroadcastAlertSink::default();
        let mut receiver = sink.subscribe();
        sink.emit(Alert::new(
            "platform",
            "corr-1",
            AlertReason::CircuitOpen,
            "breaker open",
            BreakerPhase::Open,
            0,
        ))
        .await;

        let alert = receiver.recv().await.unwrap();
        assert_eq!(alert.endpoint, "platform");
        assert_eq!(alert.severity, AlertSeverity::Critical);
    }
}
