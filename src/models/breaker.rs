use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Circuit breaker phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BreakerPhase::Closed => "CLOSED",
            BreakerPhase::Open => "OPEN",
            BreakerPhase::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{}", name)
    }
}

/// Point-in-time view of one endpoint's breaker record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub name: String,
    pub state: BreakerPhase,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_state_change_at: DateTime<Utc>,
    pub opened_until: Option<DateTime<Utc>>,
    /// Incremented on every mutation of the record
    pub version: u64,
}
