//! Agent Relay Admin CLI
//!
//! Operator tool for a running relay: trigger and watch runs, cancel them,
//! inspect or reset circuit breakers, and send signed test webhooks.

use agent_relay::engine::webhooks::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use agent_relay::SignatureVerifier;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

#[derive(Parser)]
#[command(name = "agent-relay-admin")]
#[command(about = "Agent Relay Admin CLI - trigger, inspect and debug workflow runs")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base URL of the relay server
    #[arg(long, env = "RELAY_URL", default_value = "http://localhost:4000")]
    url: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a workflow run
    Trigger {
        /// Scope to run (must exist in the server's scope table)
        #[arg(long, default_value = "quick")]
        scope: String,

        /// Session id; generated by the server when omitted
        #[arg(long)]
        session: Option<String>,

        /// JSON context passed to the platform
        #[arg(long)]
        context: Option<String>,

        /// Keep polling until the run finishes
        #[arg(long)]
        watch: bool,
    },

    /// Show one status snapshot
    Status { run_id: String },

    /// Poll a run until the server says to stop
    Watch { run_id: String },

    /// Cancel a run
    Cancel { run_id: String },

    /// Show webhook deliveries recorded for a run
    Webhooks { run_id: String },

    /// List circuit breakers, or reset one
    Breakers {
        /// Endpoint whose breaker should be closed
        #[arg(long)]
        reset: Option<String>,
    },

    /// Send a signed webhook, as the agent platform would
    SendWebhook {
        /// agent_started, agent_completed, agent_failed, workflow_completed, ...
        event_type: String,

        #[arg(long)]
        run_id: String,

        #[arg(long)]
        agent: Option<String>,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// JSON payload
        #[arg(long)]
        payload: Option<String>,

        /// Shared webhook secret
        #[arg(long, env = "RELAY__WEBHOOK__SECRET")]
        secret: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| Client::new());
    let base = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Trigger {
            scope,
            session,
            context,
            watch,
        } => {
            let context: Value = match context {
                Some(raw) => serde_json::from_str(&raw).context("--context must be valid JSON")?,
                None => Value::Null,
            };
            let body = json!({"scope": scope, "sessionId": session, "context": context});
            let response = client
                .post(format!("{}/api/v1/workflows", base))
                .json(&body)
                .send()
                .await?;
            let created = expect_json(response).await?;
            println!("{} {}", "✅ Triggered run".green().bold(), created["workflowRunId"]);
            println!("   correlation: {}", created["correlationId"]);
            println!("   session:     {}", created["sessionId"]);
            if watch {
                let run_id = created["workflowRunId"].as_str().unwrap_or_default().to_string();
                watch_run(&client, &base, &run_id).await?;
            }
        }

        Commands::Status { run_id } => {
            let snapshot = fetch_status(&client, &base, &run_id).await?;
            print_snapshot(&snapshot);
        }

        Commands::Watch { run_id } => {
            watch_run(&client, &base, &run_id).await?;
        }

        Commands::Cancel { run_id } => {
            let response = client
                .delete(format!("{}/api/v1/workflows/{}", base, run_id))
                .send()
                .await?;
            let body = expect_json(response).await?;
            println!("{} {} ({})", "🛑 Run".yellow().bold(), run_id, body["status"]);
        }

        Commands::Webhooks { run_id } => {
            let response = client
                .get(format!("{}/api/v1/workflows/{}/webhooks", base, run_id))
                .send()
                .await?;
            let records = expect_json(response).await?;
            for record in records.as_array().into_iter().flatten() {
                let marker = if !record["duplicateOf"].is_null() {
                    "dup".yellow()
                } else if record["signatureValid"] == false {
                    "sig".red()
                } else {
                    "new".green()
                };
                println!(
                    "[{}] {} {} agent={} offset={} http={}",
                    marker,
                    record["receivedAt"].as_str().unwrap_or("-"),
                    record["eventType"].as_str().unwrap_or("?"),
                    record["agentId"].as_str().unwrap_or("-"),
                    record["sequenceOffset"],
                    record["httpStatus"]
                );
            }
        }

        Commands::Breakers { reset } => {
            if let Some(name) = reset {
                let response = client
                    .post(format!("{}/api/v1/breakers/{}/reset", base, name))
                    .send()
                    .await?;
                expect_json(response).await?;
                println!("{} {}", "🔧 Reset breaker".green().bold(), name);
            }
            let response = client
                .get(format!("{}/api/v1/breakers", base))
                .send()
                .await?;
            let breakers = expect_json(response).await?;
            for breaker in breakers.as_array().into_iter().flatten() {
                let state = breaker["state"].as_str().unwrap_or("?");
                let colored_state = match state {
                    "CLOSED" => state.green(),
                    "HALF_OPEN" => state.yellow(),
                    _ => state.red(),
                };
                println!(
                    "{:<24} {:<10} failures={} successes={}",
                    breaker["name"].as_str().unwrap_or("?"),
                    colored_state,
                    breaker["failure_count"],
                    breaker["success_count"]
                );
            }
        }

        Commands::SendWebhook {
            event_type,
            run_id,
            agent,
            offset,
            payload,
            secret,
        } => {
            let payload: Value = match payload {
                Some(raw) => serde_json::from_str(&raw).context("--payload must be valid JSON")?,
                None => json!({}),
            };
            let body = json!({
                "eventType": event_type,
                "workflowRunId": run_id,
                "agentId": agent,
                "sequenceOffset": offset,
                "payload": payload,
            })
            .to_string();

            let verifier = SignatureVerifier::new(&secret, Duration::from_secs(300));
            let timestamp = chrono::Utc::now().timestamp();
            let signature = verifier.sign(timestamp, body.as_bytes())?;
            debug!(timestamp, signature = %signature, "Signed webhook");

            let response = client
                .post(format!("{}/api/v1/webhooks", base))
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp.to_string())
                .header("content-type", "application/json")
                .body(body)
                .send()
                .await?;
            let ack = expect_json(response).await?;
            println!("{} {}", "📨 Ack".green().bold(), ack);
        }
    }

    Ok(())
}

async fn expect_json(response: Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body["error"]["message"]
            .as_str()
            .unwrap_or("Unknown error")
            .to_string();
        eprintln!("{} {} {}", "❌".red(), status, message.red());
        bail!("request failed with {}", status);
    }
    Ok(body)
}

async fn fetch_status(client: &Client, base: &str, run_id: &str) -> Result<Value> {
    let response = client
        .get(format!("{}/api/v1/workflows/{}/status", base, run_id))
        .send()
        .await?;
    expect_json(response).await
}

/// Follows the server's polling hints until it says to stop
async fn watch_run(client: &Client, base: &str, run_id: &str) -> Result<()> {
    loop {
        let snapshot = fetch_status(client, base, run_id).await?;
        print_snapshot(&snapshot);
        if snapshot["shouldContinuePolling"] != true {
            return Ok(());
        }
        let wait = snapshot["nextPollIntervalMs"].as_u64().unwrap_or(2_000);
        tokio::time::sleep(Duration::from_millis(wait)).await;
    }
}

fn print_snapshot(snapshot: &Value) {
    let status = snapshot["status"].as_str().unwrap_or("?");
    let colored_status = match status {
        "completed" => status.green().bold(),
        "failed" | "timeout" => status.red().bold(),
        "cancelled" => status.yellow().bold(),
        _ => status.cyan().bold(),
    };
    let mut flags = Vec::new();
    if snapshot["stale"] == true {
        flags.push("stale".yellow().to_string());
    }
    if snapshot["fallback"] == true {
        flags.push("fallback".magenta().to_string());
    }
    println!(
        "{} {:>6.2}% poll #{} {}",
        colored_status,
        snapshot["progressPercent"].as_f64().unwrap_or(0.0),
        snapshot["pollAttempt"],
        flags.join(" ")
    );
    for agent in snapshot["agents"].as_array().into_iter().flatten() {
        println!(
            "   {:<18} {}",
            agent["agentId"].as_str().unwrap_or("?"),
            agent["outcome"].as_str().unwrap_or("?")
        );
    }
}
