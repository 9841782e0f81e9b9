// Agent Relay - HTTP server
// Run with: cargo run --bin server -- --config relay.toml

//! # Agent Relay Server Binary
//!
//! Loads `.env`, then the layered [`RelayConfig`], initializes tracing and
//! hands everything to [`RelayServerBuilder`].
//!
//! ```text
//! main()
//!   ↓ dotenv + clap
//! RelayConfig::load (defaults < relay.toml < RELAY__* env)
//!   ↓
//! RelayServerBuilder::with_config(..).build_and_run()
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Async Main Function
//! `#[tokio::main]` wraps `main` in a multi-threaded tokio runtime so the
//! body can `.await` directly.

use agent_relay::{RelayConfig, RelayServerBuilder};
use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent-relay")]
#[command(about = "Agent Relay - reliable trigger, webhook and status relay for agent workflows")]
#[command(version)]
struct Cli {
    /// TOML configuration file (defaults to ./relay.toml when present)
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides server.port
    #[arg(short, long, env = "RELAY_PORT")]
    port: Option<u16>,

    /// Emit JSON log lines instead of human-readable output
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional; production sets the environment directly
    if let Err(e) = dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
        eprintln!("Environment variables must be set manually or via system configuration");
    }

    let cli = Cli::parse();
    let mut config = RelayConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config = config.with_port(port);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs || config.server.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("🚀 Starting Agent Relay Server...");
    info!("=====================================");
    info!("Server: {}:{}", config.server.host, config.server.port);
    info!(
        "Retry: {} attempts, {}ms base delay, {}ms cap",
        config.reliability.max_attempts,
        config.reliability.base_delay_ms,
        config.reliability.max_delay_ms
    );
    info!(
        "Breaker: opens after {} failures, half-open after {}s",
        config.reliability.failure_threshold, config.reliability.open_timeout_secs
    );
    info!("Failure policy: {:?}", config.tracker.failure_policy);

    RelayServerBuilder::new()
        .with_config(config)
        .build_and_run()
        .await?;

    Ok(())
}
