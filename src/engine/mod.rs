// Agent Relay Engine
// Reliability, ingestion and state tracking engines behind the HTTP surface

//! # Agent Relay Engine Module
//!
//! This module contains the engines that sit between the domain models and
//! the outside world: the agent platform we call, and the webhooks it sends
//! back.
//!
//! ## Architecture Overview
//!
//! - **Domain Models**: Plain data and state machines (in `models/`)
//! - **Engine Layer**: Everything that mutates state or talks to the network (this module)
//! - **Server Layer**: Axum routes and wiring (in `api/` and `server/`)
//!
//! ```text
//!  POST /trigger ──► TriggerGateway ──► ReliabilityInvoker ──► agent platform
//!                        │                 (breaker, retry,         │
//!                        ▼                  fallback, alerts)       │ webhooks
//!                   StateTracker ◄──────── WebhookPipeline ◄────────┘
//!                        │
//!                        ├──► EventStreamPublisher ──► SSE subscribers
//!                        └──► RelayStorage ◄────────── StatusQuery ◄── GET /status
//! ```
//!
//! ## Engine Components
//!
//! ### Reliability (`breaker`, `retry`, `invoker`, `alerts`, `http_endpoint`)
//! - Keyed circuit breakers shared by every outbound call
//! - Exponential backoff with jitter; 4xx never retried
//! - Last-known-good fallback records and alert emission
//!
//! ### Workflow Coordination (`gateway`, `sessions`, `tracker`, `liveness`)
//! - One active run per session
//! - Agent and workflow state machines, progress aggregation
//! - Automatic agent retries and liveness timeouts
//!
//! ### Ingestion and Views (`webhooks`, `stream`, `status`)
//! - Signed, deduplicated, audited webhook intake
//! - Sequenced event stream and bounded-polling status snapshots
//!
//! ## Rust Learning Notes:
//!
//! ### Shared Ownership
//! Every engine is held behind an `Arc` and shared between the HTTP handlers
//! and background tasks. Mutable state lives inside `DashMap`s and
//! `tokio::sync` primitives, so the engines themselves expose `&self` methods.

/// Alert events raised by the reliability invoker
pub mod alerts;

/// Keyed circuit breaker registry
pub mod breaker;

/// Trigger gateway and agent retry worker
pub mod gateway;

/// reqwest-backed platform endpoint
pub mod http_endpoint;

/// Breaker + retry + fallback call contract
pub mod invoker;

/// Background timeout sweeps
pub mod liveness;

/// Retry policy and outbound error classification
pub mod retry;

/// Active-run-per-session registry
pub mod sessions;

/// Bounded-polling status snapshots
pub mod status;

/// Storage abstraction layer
///
/// Contains:
/// - RelayStorage trait definition
/// - In-memory storage implementation
pub mod storage;

/// Sequenced state change stream
pub mod stream;

/// Agent and workflow state machines
pub mod tracker;

/// Webhook authentication, deduplication and application
pub mod webhooks;

pub use alerts::{Alert, AlertReason, AlertSeverity, AlertSink, BroadcastAlertSink, TracingAlertSink};
pub use breaker::{Admission, BreakerConfig, CircuitBreakerRegistry};
pub use gateway::{TriggerGateway, TriggerRequest};
pub use http_endpoint::HttpTriggerEndpoint;
pub use invoker::{CallMeta, ExternalEndpoint, InvocationResult, ReliabilityConfig, ReliabilityInvoker};
pub use liveness::LivenessMonitor;
pub use retry::{retry_with_policy, BackoffStrategy, CallError, RetryOutcome, RetryPolicy};
pub use sessions::SessionRegistry;
pub use status::{PollingPolicy, StatusQuery};
pub use storage::{InMemoryStorage, RelayStorage};
pub use stream::{EventStreamPublisher, SequenceDedup};
pub use tracker::{AgentUpdate, FailurePolicy, RetryRequest, StateTracker, SweepReport, TrackerConfig};
pub use webhooks::{SignatureVerifier, WebhookConfig, WebhookHeaders, WebhookPipeline};
