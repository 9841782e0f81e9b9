// Periodic liveness sweep over active workflow runs

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::tracker::{StateTracker, SweepReport};
use crate::Result;

/// Times out stuck agents and overdue runs on a fixed interval
pub struct LivenessMonitor {
    tracker: Arc<StateTracker>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(tracker: Arc<StateTracker>, interval: Duration) -> Self {
        Self { tracker, interval }
    }

    pub async fn run_once(&self) -> Result<SweepReport> {
        let report = self.tracker.sweep_timeouts(Utc::now()).await?;
        if !report.timed_out_agents.is_empty() || !report.timed_out_runs.is_empty() {
            info!(
                timed_out_agents = report.timed_out_agents.len(),
                timed_out_runs = report.timed_out_runs.len(),
                "⏰ Liveness sweep applied timeouts"
            );
        }
        Ok(report)
    }

    /// Runs until `shutdown` fires
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(error = %e, "Liveness sweep failed");
                        }
                    }
                }
            }
            debug!("Liveness monitor stopped");
        })
    }
}
