// Layered configuration for the relay server
// Defaults < optional TOML file < RELAY__* environment variables

//! # Configuration
//!
//! [`RelayConfig`] is assembled by the `config` crate from three layers:
//!
//! 1. Defaults (the `Default` impls below)
//! 2. An optional TOML file (`relay.toml` unless told otherwise)
//! 3. Environment variables prefixed `RELAY__`, with `__` between path
//!    segments: `RELAY__WEBHOOK__SECRET`, `RELAY__SERVER__PORT`, ...
//!
//! The server binary loads `.env` with `dotenv` before any of this runs, so
//! the environment layer also sees values from that file.
//!
//! ```toml
//! [platform]
//! trigger_url = "https://agents.example.com/v1/workflows"
//!
//! [tracker]
//! failure_policy = "all_agents_fail"
//!
//! [[scopes.quick]]
//! agent_id = "intake"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::engine::breaker::BreakerConfig;
use crate::engine::invoker::ReliabilityConfig;
use crate::engine::retry::{BackoffStrategy, RetryPolicy};
use crate::engine::status::PollingPolicy;
use crate::engine::tracker::{FailurePolicy, TrackerConfig};
use crate::engine::webhooks::WebhookConfig;
use crate::models::AgentSpec;
use crate::{RelayError, Result};

pub const ENV_PREFIX: &str = "RELAY";
pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Permissive CORS for browser dashboards
    pub cors: bool,
    /// `pretty` or `json`
    pub log_format: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            cors: true,
            log_format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    pub endpoint_name: String,
    /// Without it the server starts, but every trigger fails with a configuration error
    pub trigger_url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            endpoint_name: "agent-platform".to_string(),
            trigger_url: None,
            api_key: None,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilitySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub backoff: BackoffStrategy,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_secs: u64,
    pub monitoring_window_secs: u64,
    pub fallback_ttl_secs: u64,
}

impl Default for ReliabilitySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            jitter: 0.5,
            backoff: BackoffStrategy::default(),
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_secs: 60,
            monitoring_window_secs: 120,
            fallback_ttl_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub secret: String,
    pub timestamp_tolerance_secs: u64,
    pub processing_budget_ms: u64,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            secret: String::new(),
            timestamp_tolerance_secs: 300,
            processing_budget_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub execution_window_secs: u64,
    pub max_agent_retries: u32,
    pub workflow_timeout_secs: u64,
    pub failure_policy: FailurePolicy,
    pub liveness_interval_secs: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            execution_window_secs: 600,
            max_agent_retries: 2,
            workflow_timeout_secs: 1_800,
            failure_policy: FailurePolicy::default(),
            liveness_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub max_attempts: u32,
    pub max_duration_secs: u64,
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            max_attempts: 120,
            max_duration_secs: 1_800,
            base_interval_ms: 2_000,
            max_interval_ms: 30_000,
        }
    }
}

/// Complete server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerSettings,
    pub platform: PlatformSettings,
    pub reliability: ReliabilitySettings,
    pub webhook: WebhookSettings,
    pub tracker: TrackerSettings,
    pub polling: PollingSettings,
    /// Scope name → agents it schedules
    pub scopes: HashMap<String, Vec<AgentSpec>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            platform: PlatformSettings::default(),
            reliability: ReliabilitySettings::default(),
            webhook: WebhookSettings::default(),
            tracker: TrackerSettings::default(),
            polling: PollingSettings::default(),
            scopes: default_scopes(),
        }
    }
}

/// The `quick` scope: nine agents, all critical
fn default_scopes() -> HashMap<String, Vec<AgentSpec>> {
    let quick = [
        "intake",
        "profile",
        "enrichment",
        "classification",
        "risk",
        "compliance",
        "pricing",
        "summary",
        "notification",
    ]
    .into_iter()
    .map(AgentSpec::new)
    .collect();
    HashMap::from([("quick".to_string(), quick)])
}

impl RelayConfig {
    /// Defaults, then `path` (or `relay.toml` if present), then `RELAY__*`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => ::config::File::from(path).required(true),
            None => ::config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let config: RelayConfig = ::config::Config::builder()
            .add_source(file)
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(RelayError::Configuration(message.to_string()));

        if self.webhook.secret.trim().is_empty() {
            return invalid("webhook.secret must be set");
        }
        if self.reliability.max_attempts == 0 {
            return invalid("reliability.max_attempts must be at least 1");
        }
        if !(0.0..1.0).contains(&self.reliability.jitter) {
            return invalid("reliability.jitter must be in [0, 1)");
        }
        if self.reliability.base_delay_ms > self.reliability.max_delay_ms {
            return invalid("reliability.base_delay_ms exceeds max_delay_ms");
        }
        if let BackoffStrategy::Exponential { multiplier } = self.reliability.backoff {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return invalid("reliability.backoff.multiplier must be a finite number >= 1");
            }
        }
        if self.reliability.failure_threshold == 0 || self.reliability.success_threshold == 0 {
            return invalid("breaker thresholds must be at least 1");
        }
        if self.polling.max_attempts == 0 || self.polling.base_interval_ms > self.polling.max_interval_ms {
            return invalid("polling bounds are inconsistent");
        }
        if self.tracker.liveness_interval_secs == 0 {
            return invalid("tracker.liveness_interval_secs must be positive");
        }
        if self.scopes.is_empty() {
            return invalid("at least one scope must be configured");
        }
        if let Some((name, _)) = self.scopes.iter().find(|(_, agents)| agents.is_empty()) {
            return Err(RelayError::Configuration(format!("scope '{}' has no agents", name)));
        }
        if let Some(url) = &self.platform.trigger_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return invalid("platform.trigger_url must be an http(s) URL");
            }
        }
        Ok(())
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.server.port = port;
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook.secret = secret.into();
        self
    }

    pub fn with_trigger_url(mut self, url: impl Into<String>) -> Self {
        self.platform.trigger_url = Some(url.into());
        self
    }

    pub fn with_scope(mut self, name: impl Into<String>, agents: Vec<AgentSpec>) -> Self {
        self.scopes.insert(name.into(), agents);
        self
    }

    pub fn reliability_config(&self) -> ReliabilityConfig {
        let r = &self.reliability;
        ReliabilityConfig {
            retry: RetryPolicy {
                max_attempts: r.max_attempts,
                base_delay: Duration::from_millis(r.base_delay_ms),
                max_delay: Duration::from_millis(r.max_delay_ms),
                jitter: r.jitter,
                strategy: r.backoff.clone(),
            },
            breaker: BreakerConfig {
                failure_threshold: r.failure_threshold,
                success_threshold: r.success_threshold,
                open_timeout: Duration::from_secs(r.open_timeout_secs),
                monitoring_window: Duration::from_secs(r.monitoring_window_secs),
            },
            fallback_ttl: Duration::from_secs(r.fallback_ttl_secs),
            attempt_timeout: Duration::from_secs(self.platform.request_timeout_secs),
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            execution_window: Duration::from_secs(self.tracker.execution_window_secs),
            max_agent_retries: self.tracker.max_agent_retries,
            workflow_timeout: Duration::from_secs(self.tracker.workflow_timeout_secs),
            failure_policy: self.tracker.failure_policy,
            fallback_ttl: Duration::from_secs(self.reliability.fallback_ttl_secs),
        }
    }

    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig {
            secret: self.webhook.secret.clone(),
            timestamp_tolerance: Duration::from_secs(self.webhook.timestamp_tolerance_secs),
            processing_budget: Duration::from_millis(self.webhook.processing_budget_ms),
        }
    }

    pub fn polling_policy(&self) -> PollingPolicy {
        PollingPolicy {
            max_attempts: self.polling.max_attempts,
            max_duration: Duration::from_secs(self.polling.max_duration_secs),
            base_interval: Duration::from_millis(self.polling.base_interval_ms),
            max_interval: Duration::from_millis(self.polling.max_interval_ms),
        }
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.tracker.liveness_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::assert_err;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = RelayConfig::default().with_webhook_secret("s3cret");
        config.validate().unwrap();

        let reliability = config.reliability_config();
        assert_eq!(reliability.retry.max_attempts, 4);
        assert_eq!(reliability.retry.base_delay, Duration::from_secs(2));
        assert_eq!(reliability.retry.max_delay, Duration::from_secs(30));
        assert_eq!(reliability.breaker.failure_threshold, 5);
        assert_eq!(config.scopes["quick"].len(), 9);
        assert_eq!(config.tracker_config().failure_policy, FailurePolicy::AnyCritical);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(matches!(
            RelayConfig::default().validate(),
            Err(RelayError::Configuration(_))
        ));

        let mut config = RelayConfig::default().with_webhook_secret("s3cret");
        config.reliability.jitter = 1.5;
        assert_err!(config.validate());

        let config = RelayConfig::default()
            .with_webhook_secret("s3cret")
            .with_scope("empty", Vec::new());
        assert_err!(config.validate());

        for multiplier in [-2.0, 0.5, f64::NAN, f64::INFINITY] {
            let mut config = RelayConfig::default().with_webhook_secret("s3cret");
            config.reliability.backoff = BackoffStrategy::Exponential { multiplier };
            assert_err!(config.validate());
        }

        let config = RelayConfig::default()
            .with_webhook_secret("s3cret")
            .with_trigger_url("ftp://agents");
        assert_err!(config.validate());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = std::env::temp_dir().join(format!("relay-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("relay.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[server]
port = 8088

[webhook]
secret = "from-file"

[tracker]
failure_policy = "all_agents_fail"
max_agent_retries = 0

[[scopes.deep]]
agent_id = "crawler"

[[scopes.deep]]
agent_id = "digest"
critical = false
"#
        )
        .unwrap();

        let config = RelayConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.webhook.secret, "from-file");
        assert_eq!(config.tracker.failure_policy, FailurePolicy::AllAgentsFail);
        assert_eq!(config.scopes["deep"].len(), 2);
        assert!(!config.scopes["deep"][1].critical);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
