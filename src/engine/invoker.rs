// Reliability invoker: circuit breaker + retry + fallback cache + alerting
// One call contract for every outbound request the relay makes

//! # Reliability Invoker
//!
//! [`ReliabilityInvoker::execute_call`] is the only way the relay talks to an
//! external endpoint. The sequence for each call is:
//!
//! 1. **Breaker check**: an OPEN breaker short-circuits straight to the
//!    fallback lookup without touching the endpoint. An OPEN breaker whose
//!    timeout elapsed admits this caller as the single HALF_OPEN trial.
//! 2. **Retry loop**: network errors, timeouts, 5xx and 429 are retried with
//!    jittered backoff; 4xx fails immediately without spending budget.
//!    A trial call gets exactly one attempt.
//! 3. **Success**: the breaker records a success and the response is cached
//!    as the [`FallbackRecord`] for `meta.fallback_key`.
//! 4. **Failure**: the breaker records a failure, an alert is emitted and an
//!    unexpired fallback is returned tagged [`DataSource::Fallback`];
//!    without one the caller gets `Unavailable` / `CircuitOpen`.
//!
//! Every branch logs endpoint, correlation id, attempts, breaker state and
//! duration.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::alerts::{Alert, AlertReason, AlertSink};
use crate::engine::breaker::{Admission, BreakerConfig, CircuitBreakerRegistry};
use crate::engine::retry::{retry_with_policy, CallError, RetryPolicy};
use crate::engine::storage::RelayStorage;
use crate::models::{BreakerPhase, DataSource, FallbackRecord};
use crate::{RelayError, Result};

/// An external system the relay can call
#[async_trait::async_trait]
pub trait ExternalEndpoint: Send + Sync {
    /// Breaker and registry key
    fn name(&self) -> &str;

    async fn call(&self, payload: &Value, meta: &CallMeta) -> std::result::Result<Value, CallError>;
}

/// Per-call metadata
#[derive(Debug, Clone)]
pub struct CallMeta {
    pub correlation_id: String,
    /// Key the response is cached under (workflow run id or agent id)
    pub fallback_key: String,
    /// Aborts outstanding attempts and retry sleeps
    pub cancel: Option<CancellationToken>,
}

impl CallMeta {
    pub fn new(correlation_id: impl Into<String>, fallback_key: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            fallback_key: fallback_key.into(),
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, |token| token.is_cancelled())
    }
}

/// Single configuration struct for every reliability concern
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub fallback_ttl: Duration,
    /// Upper bound on one attempt, independent of the retry delays
    pub attempt_timeout: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            fallback_ttl: Duration::from_secs(3600),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// What `execute_call` hands back on success
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub data: Value,
    pub source: DataSource,
    pub attempts: u32,
    pub breaker_state: BreakerPhase,
    pub duration: Duration,
    /// Set when `source` is [`DataSource::Fallback`]
    pub cached_at: Option<DateTime<Utc>>,
}

impl InvocationResult {
    pub fn is_fallback(&self) -> bool {
        self.source == DataSource::Fallback
    }
}

pub struct ReliabilityInvoker {
    config: ReliabilityConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    storage: Arc<dyn RelayStorage>,
    alerts: Arc<dyn AlertSink>,
    endpoints: DashMap<String, Arc<dyn ExternalEndpoint>>,
}

impl ReliabilityInvoker {
    pub fn new(
        config: ReliabilityConfig,
        storage: Arc<dyn RelayStorage>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
        Self::with_breakers(config, breakers, storage, alerts)
    }

    /// Share an existing breaker table (e.g. with the admin API)
    pub fn with_breakers(
        config: ReliabilityConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        storage: Arc<dyn RelayStorage>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config,
            breakers,
            storage,
            alerts,
            endpoints: DashMap::new(),
        }
    }

    pub fn register_endpoint(&self, endpoint: Arc<dyn ExternalEndpoint>) {
        info!(endpoint = endpoint.name(), "Registered external endpoint");
        self.endpoints.insert(endpoint.name().to_string(), endpoint);
    }

    pub fn has_endpoint(&self, name: &str) -> bool {
        self.endpoints.contains_key(name)
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    /// Call `endpoint_name` under the breaker, retry and fallback policies
    pub async fn execute_call(
        &self,
        endpoint_name: &str,
        payload: &Value,
        meta: &CallMeta,
    ) -> Result<InvocationResult> {
        let endpoint = self
            .endpoints
            .get(endpoint_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                RelayError::Configuration(format!("no endpoint registered as '{}'", endpoint_name))
            })?;

        if meta.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        let started = Instant::now();
        let admission = self.breakers.try_acquire(endpoint_name);

        if let Admission::Rejected { retry_in } = admission {
            info!(
                endpoint = endpoint_name,
                correlation_id = %meta.correlation_id,
                attempt = 0,
                breaker_state = %BreakerPhase::Open,
                retry_in_ms = retry_in.as_millis() as u64,
                "Breaker open, short-circuiting to fallback"
            );
            self.alerts
                .emit(Alert::new(
                    endpoint_name,
                    &meta.correlation_id,
                    AlertReason::CircuitOpen,
                    format!("call to {} blocked by open circuit", endpoint_name),
                    BreakerPhase::Open,
                    0,
                ))
                .await;
            return self
                .serve_fallback(
                    endpoint_name,
                    meta,
                    0,
                    started,
                    RelayError::CircuitOpen {
                        endpoint: endpoint_name.to_string(),
                    },
                )
                .await;
        }

        let policy = match admission {
            Admission::Trial => self.config.retry.single_attempt(),
            _ => self.config.retry.clone(),
        };
        let attempt_timeout = self.config.attempt_timeout;
        let breakers = self.breakers.clone();
        let keep_going = || {
            breakers.phase(endpoint_name) != BreakerPhase::Open && !meta.is_cancelled()
        };

        let outcome = retry_with_policy(&policy, keep_going, |attempt| {
            let endpoint = endpoint.clone();
            async move {
                debug!(
                    endpoint = endpoint_name,
                    correlation_id = %meta.correlation_id,
                    attempt,
                    "Calling external endpoint"
                );
                attempt_once(endpoint.as_ref(), payload, meta, attempt_timeout).await
            }
        })
        .await;

        let attempts = outcome.attempts;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome.result {
            Ok(data) => {
                self.breakers.record_success(endpoint_name);
                let breaker_state = self.breakers.phase(endpoint_name);
                let record = FallbackRecord::new(
                    meta.fallback_key.clone(),
                    data.clone(),
                    chrono::Duration::from_std(self.config.fallback_ttl)
                        .unwrap_or_else(|_| chrono::Duration::hours(1)),
                );
                if let Err(e) = self.storage.put_fallback(record).await {
                    warn!(endpoint = endpoint_name, error = %e, "Failed to refresh fallback record");
                }
                info!(
                    endpoint = endpoint_name,
                    correlation_id = %meta.correlation_id,
                    attempt = attempts,
                    breaker_state = %breaker_state,
                    duration_ms,
                    "✅ External call succeeded"
                );
                Ok(InvocationResult {
                    data,
                    source: DataSource::Live,
                    attempts,
                    breaker_state,
                    duration: started.elapsed(),
                    cached_at: None,
                })
            }
            Err(CallError::Cancelled) => {
                self.breakers.release_trial(endpoint_name);
                info!(
                    endpoint = endpoint_name,
                    correlation_id = %meta.correlation_id,
                    attempt = attempts,
                    breaker_state = %self.breakers.phase(endpoint_name),
                    duration_ms,
                    "External call cancelled"
                );
                Err(RelayError::Cancelled)
            }
            Err(CallError::Client { status, message }) => {
                self.breakers.release_trial(endpoint_name);
                warn!(
                    endpoint = endpoint_name,
                    correlation_id = %meta.correlation_id,
                    attempt = attempts,
                    breaker_state = %self.breakers.phase(endpoint_name),
                    duration_ms,
                    status,
                    "External endpoint rejected request"
                );
                Err(RelayError::Validation(format!(
                    "{} rejected request with {}: {}",
                    endpoint_name, status, message
                )))
            }
            Err(error) => {
                let breaker_state = self.breakers.record_failure(endpoint_name);
                error!(
                    endpoint = endpoint_name,
                    correlation_id = %meta.correlation_id,
                    attempt = attempts,
                    breaker_state = %breaker_state,
                    duration_ms,
                    error = %error,
                    "❌ External call failed after retries"
                );
                self.alerts
                    .emit(Alert::new(
                        endpoint_name,
                        &meta.correlation_id,
                        AlertReason::RetriesExhausted,
                        format!("{} failed after {} attempts: {}", endpoint_name, attempts, error),
                        breaker_state,
                        attempts,
                    ))
                    .await;
                let cause = match error {
                    CallError::RateLimited { retry_after } => RelayError::RateLimited {
                        endpoint: endpoint_name.to_string(),
                        retry_after,
                    },
                    other => RelayError::TransientNetwork {
                        endpoint: endpoint_name.to_string(),
                        message: other.to_string(),
                    },
                };
                self.serve_fallback(endpoint_name, meta, attempts, started, cause)
                    .await
            }
        }
    }

    async fn serve_fallback(
        &self,
        endpoint_name: &str,
        meta: &CallMeta,
        attempts: u32,
        started: Instant,
        cause: RelayError,
    ) -> Result<InvocationResult> {
        let breaker_state = self.breakers.phase(endpoint_name);
        let cached = match self.storage.get_fallback(&meta.fallback_key).await {
            Ok(record) => record,
            Err(e) => {
                warn!(endpoint = endpoint_name, error = %e, "Fallback lookup failed");
                None
            }
        };

        match cached.filter(|record| !record.is_expired(Utc::now())) {
            Some(record) => {
                warn!(
                    endpoint = endpoint_name,
                    correlation_id = %meta.correlation_id,
                    attempt = attempts,
                    breaker_state = %breaker_state,
                    duration_ms = started.elapsed().as_millis() as u64,
                    cached_at = %record.cached_at,
                    "Serving fallback data"
                );
                self.alerts
                    .emit(Alert::new(
                        endpoint_name,
                        &meta.correlation_id,
                        AlertReason::ServedFallback,
                        format!("served cached data for {}", meta.fallback_key),
                        breaker_state,
                        attempts,
                    ))
                    .await;
                Ok(InvocationResult {
                    data: record.payload,
                    source: DataSource::Fallback,
                    attempts,
                    breaker_state,
                    duration: started.elapsed(),
                    cached_at: Some(record.cached_at),
                })
            }
            None => {
                error!(
                    endpoint = endpoint_name,
                    correlation_id = %meta.correlation_id,
                    attempt = attempts,
                    breaker_state = %breaker_state,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "No fallback available"
                );
                Err(match cause {
                    RelayError::CircuitOpen { endpoint } => RelayError::CircuitOpen { endpoint },
                    other => RelayError::Unavailable {
                        endpoint: endpoint_name.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }
}

async fn attempt_once(
    endpoint: &dyn ExternalEndpoint,
    payload: &Value,
    meta: &CallMeta,
    timeout: Duration,
) -> std::result::Result<Value, CallError> {
    let call = tokio::time::timeout(timeout, endpoint.call(payload, meta));
    let outcome = match &meta.cancel {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => return Err(CallError::Cancelled),
                outcome = call => outcome,
            }
        }
        None => call.await,
    };
    outcome.unwrap_or(Err(CallError::Timeout(timeout)))
}
