// Keyed circuit breaker table shared by every outbound call

//! # Circuit Breaker Registry
//!
//! One breaker record per external endpoint, shared process-wide. Every
//! read-modify-write happens while holding the DashMap shard lock for that
//! key (`entry` / `get_mut`), which makes each operation an atomic
//! compare-and-swap on the record: two concurrent callers can never both see
//! `HALF_OPEN` with no trial in flight.
//!
//! ```text
//!            failure_threshold failures in window
//!   CLOSED ───────────────────────────────────────▶ OPEN
//!     ▲                                              │ open_timeout elapsed,
//!     │ success_threshold successes                  │ next caller becomes
//!     │                                              ▼ the single trial
//!     └───────────────────────────────────────── HALF_OPEN
//!                       trial failure reopens ───────┘
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Monotonic time
//! Deadlines are kept as `tokio::time::Instant`, which never jumps backwards
//! and follows `tokio::time::pause()` in tests. Wall-clock timestamps are only
//! derived when a snapshot is taken.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::models::{BreakerPhase, CircuitBreakerState};

/// Thresholds shared by every breaker in a registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures inside `monitoring_window` that open the circuit
    pub failure_threshold: u32,
    /// Consecutive HALF_OPEN successes that close it again
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub monitoring_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(120),
        }
    }
}

/// Result of asking a breaker whether a call may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call
    Closed,
    /// This caller holds the single HALF_OPEN trial slot
    Trial,
    /// Short-circuit; `retry_in` is the time left until a trial is allowed
    Rejected { retry_in: Duration },
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }

    pub fn phase(self) -> BreakerPhase {
        match self {
            Admission::Closed => BreakerPhase::Closed,
            Admission::Trial => BreakerPhase::HalfOpen,
            Admission::Rejected { .. } => BreakerPhase::Open,
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerCell {
    phase: BreakerPhase,
    failure_count: u32,
    success_count: u32,
    window_started_at: Instant,
    opened_until: Option<Instant>,
    trial_in_flight: bool,
    last_state_change_at: DateTime<Utc>,
    version: u64,
}

impl BreakerCell {
    fn new(now: Instant) -> Self {
        Self {
            phase: BreakerPhase::Closed,
            failure_count: 0,
            success_count: 0,
            window_started_at: now,
            opened_until: None,
            trial_in_flight: false,
            last_state_change_at: Utc::now(),
            version: 0,
        }
    }

    fn move_to(&mut self, phase: BreakerPhase) {
        self.phase = phase;
        self.last_state_change_at = Utc::now();
        self.success_count = 0;
        self.trial_in_flight = false;
        if phase != BreakerPhase::Open {
            self.opened_until = None;
        }
        if phase == BreakerPhase::Closed {
            self.failure_count = 0;
        }
    }
}

/// Process-wide table of breakers keyed by endpoint name
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    cells: DashMap<String, BreakerCell>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            cells: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Decide whether a call to `name` may go out
    ///
    /// An OPEN breaker whose timeout has elapsed flips to HALF_OPEN here and
    /// hands the caller the one trial slot. Later callers are rejected until
    /// that trial reports back.
    pub fn try_acquire(&self, name: &str) -> Admission {
        let now = Instant::now();
        let mut cell = self
            .cells
            .entry(name.to_string())
            .or_insert_with(|| BreakerCell::new(now));

        match cell.phase {
            BreakerPhase::Closed => Admission::Closed,
            BreakerPhase::Open => {
                let opened_until = cell.opened_until.unwrap_or(now);
                if now >= opened_until {
                    cell.move_to(BreakerPhase::HalfOpen);
                    cell.trial_in_flight = true;
                    cell.version += 1;
                    info!(endpoint = name, breaker_state = %BreakerPhase::HalfOpen, "Breaker half-open, admitting trial call");
                    Admission::Trial
                } else {
                    Admission::Rejected {
                        retry_in: opened_until - now,
                    }
                }
            }
            BreakerPhase::HalfOpen => {
                if cell.trial_in_flight {
                    Admission::Rejected {
                        retry_in: Duration::ZERO,
                    }
                } else {
                    cell.trial_in_flight = true;
                    cell.version += 1;
                    Admission::Trial
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self, name: &str) {
        let now = Instant::now();
        let mut cell = self
            .cells
            .entry(name.to_string())
            .or_insert_with(|| BreakerCell::new(now));

        match cell.phase {
            BreakerPhase::Closed => {
                cell.failure_count = 0;
                cell.window_started_at = now;
            }
            BreakerPhase::HalfOpen => {
                cell.trial_in_flight = false;
                cell.success_count += 1;
                if cell.success_count >= self.config.success_threshold {
                    cell.move_to(BreakerPhase::Closed);
                    cell.window_started_at = now;
                    info!(endpoint = name, breaker_state = %BreakerPhase::Closed, "Breaker closed after successful trials");
                }
            }
            // A straggler from before the circuit opened; the open timeout stands
            BreakerPhase::Open => {}
        }
        cell.version += 1;
    }

    /// Record a failed call; returns the phase after the update
    pub fn record_failure(&self, name: &str) -> BreakerPhase {
        let now = Instant::now();
        let mut cell = self
            .cells
            .entry(name.to_string())
            .or_insert_with(|| BreakerCell::new(now));

        match cell.phase {
            BreakerPhase::Closed => {
                if now.duration_since(cell.window_started_at) > self.config.monitoring_window {
                    cell.failure_count = 0;
                    cell.window_started_at = now;
                }
                cell.failure_count += 1;
                if cell.failure_count >= self.config.failure_threshold {
                    cell.move_to(BreakerPhase::Open);
                    cell.opened_until = Some(now + self.config.open_timeout);
                    warn!(
                        endpoint = name,
                        breaker_state = %BreakerPhase::Open,
                        failure_count = cell.failure_count,
                        "Breaker opened"
                    );
                }
            }
            BreakerPhase::HalfOpen => {
                cell.move_to(BreakerPhase::Open);
                cell.failure_count = self.config.failure_threshold;
                cell.opened_until = Some(now + self.config.open_timeout);
                warn!(endpoint = name, breaker_state = %BreakerPhase::Open, "Trial call failed, breaker reopened");
            }
            BreakerPhase::Open => {}
        }
        cell.version += 1;
        cell.phase
    }

    /// Give back a trial slot without judging the endpoint (4xx, cancellation)
    pub fn release_trial(&self, name: &str) {
        if let Some(mut cell) = self.cells.get_mut(name) {
            if cell.phase == BreakerPhase::HalfOpen && cell.trial_in_flight {
                cell.trial_in_flight = false;
                cell.version += 1;
            }
        }
    }

    /// Current phase without side effects; unknown endpoints are CLOSED
    pub fn phase(&self, name: &str) -> BreakerPhase {
        self.cells
            .get(name)
            .map(|cell| cell.phase)
            .unwrap_or(BreakerPhase::Closed)
    }

    /// Force a breaker back to CLOSED
    pub fn reset(&self, name: &str) -> bool {
        match self.cells.get_mut(name) {
            Some(mut cell) => {
                cell.move_to(BreakerPhase::Closed);
                cell.window_started_at = Instant::now();
                cell.version += 1;
                info!(endpoint = name, "Breaker manually reset");
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<CircuitBreakerState> {
        self.cells.get(name).map(|cell| to_state(name, &cell))
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerState> {
        let mut all: Vec<CircuitBreakerState> = self
            .cells
            .iter()
            .map(|entry| to_state(entry.key(), entry.value()))
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

fn to_state(name: &str, cell: &BreakerCell) -> CircuitBreakerState {
    let now = Instant::now();
    let opened_until = cell.opened_until.map(|until| {
        let remaining = until.saturating_duration_since(now);
        Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
    });
    CircuitBreakerState {
        name: name.to_string(),
        state: cell.phase,
        failure_count: cell.failure_count,
        success_count: cell.success_count,
        last_state_change_at: cell.last_state_change_at,
        opened_until,
        version: cell.version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            monitoring_window: Duration::from_secs(60),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_short_circuits() {
        let breakers = registry();
        for _ in 0..2 {
            assert_eq!(breakers.try_acquire("platform"), Admission::Closed);
            assert_eq!(breakers.record_failure("platform"), BreakerPhase::Closed);
        }
        breakers.try_acquire("platform");
        assert_eq!(breakers.record_failure("platform"), BreakerPhase::Open);

        for _ in 0..5 {
            assert!(!breakers.try_acquire("platform").is_allowed());
        }
        assert!(breakers.snapshot("platform").unwrap().opened_until.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_one_trial_after_timeout() {
        let breakers = registry();
        for _ in 0..3 {
            breakers.record_failure("platform");
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(breakers.try_acquire("platform"), Admission::Trial);
        assert_eq!(
            breakers.try_acquire("platform"),
            Admission::Rejected { retry_in: Duration::ZERO }
        );
        assert_eq!(breakers.phase("platform"), BreakerPhase::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_closes() {
        let breakers = registry();
        for _ in 0..3 {
            breakers.record_failure("platform");
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(breakers.try_acquire("platform"), Admission::Trial);
        breakers.record_success("platform");
        assert_eq!(breakers.phase("platform"), BreakerPhase::HalfOpen);

        assert_eq!(breakers.try_acquire("platform"), Admission::Trial);
        breakers.record_success("platform");
        assert_eq!(breakers.phase("platform"), BreakerPhase::Closed);
        assert_eq!(breakers.snapshot("platform").unwrap().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breakers = registry();
        for _ in 0..3 {
            breakers.record_failure("platform");
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breakers.try_acquire("platform"), Admission::Trial);
        assert_eq!(breakers.record_failure("platform"), BreakerPhase::Open);
        assert!(!breakers.try_acquire("platform").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_accumulate() {
        let breakers = registry();
        breakers.record_failure("platform");
        breakers.record_failure("platform");
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breakers.record_failure("platform"), BreakerPhase::Closed);
        assert_eq!(breakers.snapshot("platform").unwrap().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_get_a_single_trial() {
        let breakers = Arc::new(registry());
        for _ in 0..3 {
            breakers.record_failure("platform");
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let breakers = breakers.clone();
            handles.push(tokio::spawn(async move { breakers.try_acquire("platform") }));
        }
        let mut trials = 0;
        for handle in handles {
            if handle.await.unwrap() == Admission::Trial {
                trials += 1;
            }
        }
        assert_eq!(trials, 1);
    }

    #[test]
    fn test_breakers_are_keyed_per_endpoint() {
        let breakers = registry();
        for _ in 0..3 {
            breakers.record_failure("platform");
        }
        assert_eq!(breakers.phase("platform"), BreakerPhase::Open);
        assert_eq!(breakers.phase("billing"), BreakerPhase::Closed);
        assert!(breakers.reset("platform"));
        assert_eq!(breakers.phase("platform"), BreakerPhase::Closed);
    }
}
