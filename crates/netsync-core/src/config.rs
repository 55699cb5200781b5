//! Sync configuration, loadable from YAML.
//!
//! Every field has a default, so an empty file (or no file) is valid:
//!
//! ```yaml
//! position_debounce_ms: 250
//! operation_timeout_ms: 30000
//! conflict_policy: keep_winner
//! retry:
//!   initial_delay_ms: 200
//!   max_attempts: 5
//! replication:
//!   continuous: true
//!   poll_interval_ms: 1000
//! ```

use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// What to do when a load finds conflicting revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Fail the load with `SyncError::LoadConflict`.
    Reject,
    /// Keep the deterministic winner and prune the losing leaves.
    ///
    /// Lossy: edits that only exist on a losing branch are discarded.
    KeepWinner,
}

/// Backoff settings for scheduled writes (bounded) and replication (unbounded).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// None = retry forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            max_attempts: Some(5),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Spawn a background replication loop when a collection is opened.
    pub continuous: bool,
    /// Upper bound between passes when neither replica reports a change.
    pub poll_interval_ms: u64,
    /// Reconnect backoff; `max_attempts` is ignored, replication never gives up.
    pub reconnect: RetryConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            continuous: true,
            poll_interval_ms: 1_000,
            reconnect: RetryConfig {
                initial_delay_ms: 500,
                max_delay_ms: 60_000,
                backoff_factor: 2.0,
                max_attempts: None,
            },
        }
    }
}

impl ReplicationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: None,
            ..self.reconnect.policy()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Coalescing window for element position writes.
    pub position_debounce_ms: u64,
    /// Deadline for each store operation.
    pub operation_timeout_ms: u64,
    pub conflict_policy: ConflictPolicy,
    /// Retry for scheduled (background) writes.
    pub retry: RetryConfig,
    pub replication: ReplicationConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            position_debounce_ms: 250,
            operation_timeout_ms: 30_000,
            conflict_policy: ConflictPolicy::KeepWinner,
            retry: RetryConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn position_debounce(&self) -> Duration {
        Duration::from_millis(self.position_debounce_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.position_debounce(), Duration::from_millis(250));
        assert_eq!(config.conflict_policy, ConflictPolicy::KeepWinner);
        assert!(config.replication.continuous);
        assert_eq!(config.retry.max_attempts, Some(5));
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(SyncConfig::from_yaml("").unwrap(), SyncConfig::default());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let config = SyncConfig::from_yaml(
            "position_debounce_ms: 50\nconflict_policy: reject\nreplication:\n  continuous: false\n",
        )
        .unwrap();
        assert_eq!(config.position_debounce_ms, 50);
        assert_eq!(config.conflict_policy, ConflictPolicy::Reject);
        assert!(!config.replication.continuous);
        assert_eq!(config.replication.poll_interval_ms, 1_000);
        assert_eq!(config.operation_timeout_ms, 30_000);
    }

    #[test]
    fn test_reconnect_policy_is_unbounded() {
        let mut config = ReplicationConfig::default();
        config.reconnect.max_attempts = Some(3);
        assert_eq!(config.reconnect_policy().max_attempts, None);
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            SyncConfig::from_yaml("conflict_policy: coin_flip"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "operation_timeout_ms: 1500").unwrap();
        let config = SyncConfig::load(file.path()).unwrap();
        assert_eq!(config.operation_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_load_missing_file() {
        let err = SyncConfig::load(Path::new("/nonexistent/netsync.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
