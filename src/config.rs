use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// A century; longer retention is treated as "keep forever".
const MAX_RETENTION_HOURS: u64 = 24 * 365 * 100;

/// Tuning for the sync engine, merge listener and retention.
///
/// Every field has a default, so an absent or empty config file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Coarse wake-up when no signal arrives
    #[serde(default = "default_fallback_interval")]
    pub fallback_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Chain heads dispatched at the same time
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Attempts after which the queue is reported as stalled
    #[serde(default = "default_stall_after")]
    pub stall_after_attempts: u32,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    /// Purge settled tabs older than this; retention is off when unset
    #[serde(default)]
    pub retention_hours: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff(),
            max_backoff_ms: default_max_backoff(),
            fallback_interval_secs: default_fallback_interval(),
            request_timeout_ms: default_request_timeout(),
            max_in_flight: default_max_in_flight(),
            stall_after_attempts: default_stall_after(),
            probe_interval_secs: default_probe_interval(),
            retention_hours: None,
        }
    }
}

fn default_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    60_000
}

fn default_fallback_interval() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_max_in_flight() -> usize {
    4
}

fn default_stall_after() -> u32 {
    8
}

fn default_probe_interval() -> u64 {
    5
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_secs(self.fallback_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn retention(&self) -> Option<chrono::Duration> {
        self.retention_hours
            .map(|hours| chrono::Duration::hours(hours.min(MAX_RETENTION_HOURS) as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.backoff_ms, 500);
        assert_eq!(config.max_backoff_ms, 60_000);
        assert_eq!(config.fallback_interval(), Duration::from_secs(30));
        assert!(config.retention().is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "backoff_ms": 250,
            "max_backoff_ms": 5000,
            "fallback_interval_secs": 10,
            "request_timeout_ms": 2000,
            "max_in_flight": 1,
            "stall_after_attempts": 3,
            "probe_interval_secs": 2,
            "retention_hours": 48
        }"#;
        let config: SyncConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.backoff(), Duration::from_millis(250));
        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.stall_after_attempts, 3);
        assert_eq!(config.retention(), Some(chrono::Duration::hours(48)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{"max_in_flight": 2}"#).unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.max_in_flight, 2);
        assert_eq!(config.probe_interval_secs, 5);
    }
}
