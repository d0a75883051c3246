//! Engine configuration
//!
//! ```yaml
//! max_retries: 5
//! correction: heuristic   # heuristic | operator | none
//! poll_interval_ms: 200
//! read_attempts: 3
//! read_retry_delay_ms: 50
//! hot_reload: true
//! environment_dump: false
//! max_timeout_ms: 60000
//! ```

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How failed steps are corrected before a retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionMode {
    /// Rewrite the script automatically for known error kinds
    #[default]
    Heuristic,
    /// Wait for an operator to edit the script or signal
    Operator,
    /// Retry without changing anything
    None,
}

/// Interpreter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts per step before the run fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub correction: CorrectionMode,

    /// How often an operator correction checks for an edited script
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Reads of a script before a parse failure is reported
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,

    #[serde(default = "default_read_retry_delay_ms")]
    pub read_retry_delay_ms: u64,

    /// Check for script edits before every top-level step
    #[serde(default = "default_true")]
    pub hot_reload: bool,

    /// Ask the provider for an environment dump on failure
    #[serde(default)]
    pub environment_dump: bool,

    /// Upper bound for timeouts raised by corrections
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
}

fn default_max_retries() -> u32 {
    sw_core::DEFAULT_MAX_RETRIES
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_read_attempts() -> u32 {
    sw_loader::DEFAULT_READ_ATTEMPTS
}

fn default_read_retry_delay_ms() -> u64 {
    sw_loader::DEFAULT_READ_RETRY_DELAY.as_millis() as u64
}

fn default_true() -> bool {
    true
}

fn default_max_timeout_ms() -> u64 {
    60_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            correction: CorrectionMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            read_attempts: default_read_attempts(),
            read_retry_delay_ms: default_read_retry_delay_ms(),
            hot_reload: true,
            environment_dump: false,
            max_timeout_ms: default_max_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Parse from YAML
    pub fn from_yaml_str(content: &str) -> EngineResult<Self> {
        let config: Self = serde_yaml::from_str(content).map_err(|e| EngineError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Config {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_yaml_str(&content)
    }

    /// Check value ranges
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_retries == 0 {
            return Err(EngineError::Config {
                message: "max_retries must be at least 1".to_string(),
            });
        }
        if self.read_attempts == 0 {
            return Err(EngineError::Config {
                message: "read_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.correction, CorrectionMode::Heuristic);
        assert_eq!(config.read_attempts, 3);
        assert_eq!(config.read_retry_delay(), Duration::from_millis(50));
        assert!(config.hot_reload);
        assert_eq!(EngineConfig::from_yaml_str("{}").unwrap(), config);
    }

    #[test]
    fn test_parse_overrides() {
        let config = EngineConfig::from_yaml_str(
            "max_retries: 2\ncorrection: operator\nhot_reload: false\npoll_interval_ms: 10\n",
        )
        .unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.correction, CorrectionMode::Operator);
        assert!(!config.hot_reload);
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_invalid() {
        assert!(EngineConfig::from_yaml_str("max_retries: 0").is_err());
        assert!(EngineConfig::from_yaml_str("correction: psychic").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "correction: none\n").unwrap();
        assert_eq!(
            EngineConfig::from_file(&path).unwrap().correction,
            CorrectionMode::None
        );
        assert!(EngineConfig::from_file(dir.path().join("missing.yaml")).is_err());
    }
}
