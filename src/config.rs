//! Chain-state engine configuration

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants::{DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_ROLLBACK_DEPTH, DEFAULT_SCRIPT_QUEUE_CAPACITY};
use crate::types::Height;

/// Tunables for block processing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainStateConfig {
    /// Script worker threads
    pub script_workers: usize,
    /// False validates every script on the calling thread, in order
    pub concurrent_script_validation: bool,
    /// Bounded queue between replay and the script workers
    pub script_queue_capacity: usize,
    /// Flush every N applied blocks; 0 disables periodic flushes
    pub flush_interval: u32,
    /// Journals this far below the tip are pruned; 0 keeps all journals
    pub max_rollback_depth: u32,
}

impl Default for ChainStateConfig {
    fn default() -> Self {
        Self {
            script_workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            concurrent_script_validation: true,
            script_queue_capacity: DEFAULT_SCRIPT_QUEUE_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_rollback_depth: DEFAULT_MAX_ROLLBACK_DEPTH,
        }
    }
}

impl ChainStateConfig {
    /// Single worker, inline validation, no periodic flush
    pub fn deterministic() -> Self {
        Self {
            script_workers: 1,
            concurrent_script_validation: false,
            flush_interval: 0,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("failed to parse chain-state config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read chain-state config {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("invalid chain-state config {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.script_workers == 0 {
            bail!("script_workers must be at least 1");
        }
        if self.script_queue_capacity == 0 {
            bail!("script_queue_capacity must be at least 1");
        }
        if Height::try_from(self.max_rollback_depth).is_err() {
            bail!("max_rollback_depth must not exceed {}", Height::MAX);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ChainStateConfig::default();
        assert!(config.script_workers >= 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ChainStateConfig::from_json_str(r#"{ "flush_interval": 5 }"#).unwrap();
        assert_eq!(config.flush_interval, 5);
        assert_eq!(config.max_rollback_depth, DEFAULT_MAX_ROLLBACK_DEPTH);
        assert!(config.concurrent_script_validation);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(ChainStateConfig::from_json_str(r#"{ "script_workers": 0 }"#).is_err());
        assert!(ChainStateConfig::from_json_str(r#"{ "script_queue_capacity": 0 }"#).is_err());
    }

    #[test]
    fn test_rollback_depth_beyond_height_range_rejected() {
        assert!(ChainStateConfig::from_json_str(r#"{ "max_rollback_depth": 2147483648 }"#).is_err());
        let config = ChainStateConfig::from_json_str(r#"{ "max_rollback_depth": 2147483647 }"#).unwrap();
        assert_eq!(config.max_rollback_depth, Height::MAX as u32);
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(ChainStateConfig::from_json_str("{ flush_interval").is_err());
    }
}
