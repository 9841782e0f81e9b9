use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Last-known-good payload served when live data is unavailable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRecord {
    /// Workflow run id, agent id or endpoint-scoped key
    pub key: String,
    pub payload: serde_json::Value,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FallbackRecord {
    pub fn new(key: impl Into<String>, payload: serde_json::Value, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            payload,
            cached_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Origin of data handed back to a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Live,
    Fallback,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let record = FallbackRecord::new("run-1", serde_json::json!({"ok": true}), Duration::seconds(60));
        assert!(!record.is_expired(Utc::now()));
        assert!(record.is_expired(Utc::now() + Duration::seconds(61)));
    }
}
