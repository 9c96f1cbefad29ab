//! # config
//!
//! why: make the processing loop's tunables and failure policies explicit
//! relations: consumed by state_machine.rs and controller.rs
//! what: ProcessingConfig, StorageRetryPolicy, JSON loading and validation

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How appending output records reacts to storage i/o errors
///
/// The loop retries `max_attempts` times in total, sleeping `backoff_ms`
/// between attempts, then stops with a fatal fault so the partition can be
/// restarted and replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageRetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for StorageRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 50,
        }
    }
}

impl StorageRetryPolicy {
    /// Fail on the first storage error
    pub fn fail_fast() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Configuration of one partition's processing loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Name used in logs, usually `<processor>-<partition>`
    pub name: String,
    /// Attempts while `execute_side_effects` reports it is not done yet
    pub max_side_effect_attempts: u32,
    /// Upper bound of records one event processor may write per cycle
    pub max_batch_records: usize,
    /// How often a paused loop re-checks `should_process_next`
    pub pause_recheck_ms: u64,
    pub storage_retry: StorageRetryPolicy,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            name: "stream-processor".to_string(),
            max_side_effect_attempts: 3,
            max_batch_records: 1024,
            pause_recheck_ms: 10,
            storage_retry: StorageRetryPolicy::default(),
        }
    }
}

impl ProcessingConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_side_effect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_side_effect_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_batch_records == 0 {
            return Err(ConfigError::Invalid(
                "max_batch_records must be at least 1".to_string(),
            ));
        }
        if self.storage_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "storage_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pause_recheck(&self) -> Duration {
        Duration::from_millis(self.pause_recheck_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ProcessingConfig::default();
        assert_eq!(config.max_side_effect_attempts, 3);
        assert_eq!(config.storage_retry.max_attempts, 3);
        assert_eq!(config.storage_retry.backoff(), Duration::from_millis(50));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = ProcessingConfig::from_json_str(
            r#"{ "name": "workflow-1", "storage_retry": { "max_attempts": 5 } }"#,
        )
        .unwrap();

        assert_eq!(config.name, "workflow-1");
        assert_eq!(config.storage_retry.max_attempts, 5);
        assert_eq!(config.storage_retry.backoff_ms, 50);
        assert_eq!(config.max_batch_records, 1024);
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let result = ProcessingConfig::from_json_str(r#"{ "max_side_effect_attempts": 0 }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let result = ProcessingConfig::from_json_str("{ name: ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processing.json");
        std::fs::write(&path, r#"{ "pause_recheck_ms": 25 }"#).unwrap();

        let config = ProcessingConfig::from_file(&path).unwrap();
        assert_eq!(config.pause_recheck(), Duration::from_millis(25));
    }
}
