// Agent Relay server assembly
// Wires configuration, engines and the HTTP router into one runnable server

//! # Relay Server
//!
//! [`RelayServerBuilder`] turns a [`RelayConfig`] into a [`RelayServer`]:
//!
//! ```text
//! RelayConfig
//!   ↓ build()
//! storage ─► breakers ─► ReliabilityInvoker ─► TriggerGateway ──┐
//!        └─► EventStreamPublisher ─► StateTracker ─► WebhookPipeline ─► AppState ─► Router
//!                                         └─► LivenessMonitor   └─► StatusQuery ─┘
//! ```
//!
//! `build()` only wires objects together. Background work (the agent retry
//! worker and the liveness sweep) starts in [`RelayServer::spawn_background`],
//! which [`RelayServer::run`] calls before binding the listener.
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects for Swappable Parts
//! Storage, alert sinks and external endpoints are held as `Arc<dyn Trait>`,
//! so tests can plug in scripted endpoints or failing stores without the
//! server knowing the difference.

use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::config::RelayConfig;
use crate::engine::{
    AlertSink, BroadcastAlertSink, EventStreamPublisher, ExternalEndpoint,
    HttpTriggerEndpoint, InMemoryStorage, LivenessMonitor, ReliabilityInvoker, RelayStorage,
    RetryRequest, SessionRegistry, StateTracker, StatusQuery, TriggerGateway, WebhookPipeline,
};
use crate::{RelayError, Result};

/// A fully wired relay, ready to serve
pub struct RelayServer {
    config: RelayConfig,
    state: AppState,
    tracker: Arc<StateTracker>,
    alerts: Arc<BroadcastAlertSink>,
    retry_requests: Option<mpsc::UnboundedReceiver<RetryRequest>>,
    shutdown: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl RelayServer {
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    /// Alerts raised by the reliability invoker, for operators who want more than logs
    pub fn alerts(&self) -> &Arc<BroadcastAlertSink> {
        &self.alerts
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Router with CORS and request tracing applied
    pub fn router(&self) -> Router {
        let router = api::routes(self.state.clone()).layer(TraceLayer::new_for_http());
        if self.config.server.cors {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Starts the retry worker and the liveness monitor; calling it twice is a no-op
    pub fn spawn_background(&mut self) {
        let Some(requests) = self.retry_requests.take() else {
            return;
        };
        self.background
            .push(self.state.gateway.spawn_retry_worker(requests));
        let monitor = LivenessMonitor::new(self.tracker.clone(), self.config.liveness_interval());
        self.background.push(monitor.spawn(self.shutdown.clone()));
    }

    /// Serves until Ctrl-C or until the shutdown token fires
    pub async fn run(mut self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| RelayError::Configuration(format!("invalid listen address: {}", e)))?;
        self.spawn_background();

        let app = self.router();
        info!("🚀 Agent Relay server starting");
        info!("📡 Listening on http://{}", addr);
        info!("🔗 API endpoints:");
        info!("   POST   http://{}/api/v1/workflows", addr);
        info!("   GET    http://{}/api/v1/workflows/:id/status", addr);
        info!("   GET    http://{}/api/v1/workflows/:id/events", addr);
        info!("   DELETE http://{}/api/v1/workflows/:id", addr);
        info!("   POST   http://{}/api/v1/webhooks", addr);
        info!("   GET    http://{}/health", addr);
        info!("📋 Scopes: {:?}", self.config.scopes.keys().collect::<Vec<_>>());
        match &self.config.platform.trigger_url {
            Some(url) => info!("✅ Agent platform: {}", url),
            None => warn!("⚠️  No platform.trigger_url configured; triggers will be rejected"),
        }

        let shutdown = self.shutdown.clone();
        axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
            .await
            .map_err(|e| RelayError::Internal(format!("server error: {}", e)))?;

        shutdown.cancel();
        for handle in self.background {
            handle.abort();
        }
        info!("👋 Agent Relay server stopped");
        Ok(())
    }
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Could not listen for Ctrl-C");
                token.cancelled().await;
            }
            info!("🛑 Shutdown signal received");
        }
        _ = token.cancelled() => {}
    }
}

/// Builder for [`RelayServer`]
pub struct RelayServerBuilder {
    config: RelayConfig,
    storage: Option<Arc<dyn RelayStorage>>,
    endpoints: Vec<Arc<dyn ExternalEndpoint>>,
}

impl RelayServerBuilder {
    pub fn new() -> Self {
        Self {
            config: RelayConfig::default(),
            storage: None,
            endpoints: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn RelayStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Registers an endpoint in place of the HTTP client built from config
    pub fn with_endpoint(mut self, endpoint: Arc<dyn ExternalEndpoint>) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn build(self) -> Result<RelayServer> {
        let config = self.config;
        config.validate()?;

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::new()) as Arc<dyn RelayStorage>);
        let alerts = Arc::new(BroadcastAlertSink::default());
        let invoker = Arc::new(ReliabilityInvoker::new(
            config.reliability_config(),
            storage.clone(),
            alerts.clone() as Arc<dyn AlertSink>,
        ));
        for endpoint in self.endpoints {
            invoker.register_endpoint(endpoint);
        }
        if let Some(url) = &config.platform.trigger_url {
            if !invoker.has_endpoint(&config.platform.endpoint_name) {
                let mut endpoint = HttpTriggerEndpoint::new(
                    config.platform.endpoint_name.clone(),
                    url.clone(),
                    std::time::Duration::from_secs(config.platform.request_timeout_secs),
                );
                if let Some(key) = &config.platform.api_key {
                    endpoint = endpoint.with_api_key(key.clone());
                }
                invoker.register_endpoint(Arc::new(endpoint));
            }
        }

        let sessions = Arc::new(SessionRegistry::new());
        let publisher = Arc::new(EventStreamPublisher::default());
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(
            StateTracker::new(
                config.tracker_config(),
                storage.clone(),
                publisher.clone(),
                sessions.clone(),
            )
            .with_retry_sender(retry_tx),
        );
        let gateway = Arc::new(TriggerGateway::new(
            config.platform.endpoint_name.clone(),
            config.scopes.clone(),
            invoker.clone(),
            tracker.clone(),
            sessions,
            storage.clone(),
        ));
        let pipeline = Arc::new(WebhookPipeline::new(
            &config.webhook_config(),
            storage.clone(),
            tracker.clone(),
        ));
        let status = Arc::new(StatusQuery::new(storage.clone(), config.polling_policy()));

        Ok(RelayServer {
            config,
            state: AppState {
                gateway,
                pipeline,
                status,
                publisher,
                invoker,
                storage,
            },
            tracker,
            alerts,
            retry_requests: Some(retry_rx),
            shutdown: CancellationToken::new(),
            background: Vec::new(),
        })
    }

    pub async fn build_and_run(self) -> Result<()> {
        self.build()?.run().await
    }
}

impl Default for RelayServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
