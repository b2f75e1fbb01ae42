//! Configuration for the Stratus control-plane core
//!
//! Structured configuration with defaults, TOML loading, environment
//! variable overrides and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{StratusError, StratusResult};

pub mod defaults;

pub use defaults::*;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StratusConfig {
    /// Management-node id stamped on work items
    pub node_id: u64,

    pub storage: StorageConfig,

    pub agent: AgentConfig,

    pub orchestrator: OrchestratorConfig,

    pub work: WorkConfig,

    pub placement: PlacementConfig,

    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

/// Agent transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Wait budget for commands that do not name their own
    #[serde(with = "humantime_serde")]
    pub command_wait: Duration,

    /// Wait budget for power-state probes
    #[serde(with = "humantime_serde")]
    pub probe_wait: Duration,

    /// Pending commands buffered per host session
    pub channel_depth: usize,
}

/// Per-operation wait budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    #[serde(with = "humantime_serde")]
    pub migrate_wait: Duration,

    #[serde(with = "humantime_serde")]
    pub storage_migrate_wait: Duration,

    #[serde(with = "humantime_serde")]
    pub start_wait: Duration,

    #[serde(with = "humantime_serde")]
    pub stop_wait: Duration,

    #[serde(with = "humantime_serde")]
    pub scale_wait: Duration,

    /// Hosts tried by a start before giving up
    pub start_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkConfig {
    /// Bounded wait for the per-VM advisory lock
    #[serde(with = "humantime_serde")]
    pub lock_wait: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,

    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
}

impl Default for StratusConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            storage: StorageConfig::default(),
            agent: AgentConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            work: WorkConfig::default(),
            placement: PlacementConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command_wait: duration_secs(DEFAULT_AGENT_COMMAND_WAIT_SECS),
            probe_wait: duration_secs(DEFAULT_AGENT_PROBE_WAIT_SECS),
            channel_depth: DEFAULT_AGENT_CHANNEL_DEPTH,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            migrate_wait: duration_secs(DEFAULT_MIGRATE_WAIT_SECS),
            storage_migrate_wait: duration_secs(DEFAULT_STORAGE_MIGRATE_WAIT_SECS),
            start_wait: duration_secs(DEFAULT_START_WAIT_SECS),
            stop_wait: duration_secs(DEFAULT_STOP_WAIT_SECS),
            scale_wait: duration_secs(DEFAULT_SCALE_WAIT_SECS),
            start_retries: DEFAULT_START_RETRIES,
        }
    }
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            lock_wait: duration_ms(DEFAULT_LOCK_WAIT_MS),
        }
    }
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_PLACEMENT_MAX_RETRIES,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: DEFAULT_RECOVERY_ENABLED,
            scan_interval: duration_secs(DEFAULT_RECOVERY_SCAN_INTERVAL_SECS),
        }
    }
}

impl StratusConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> StratusResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: StratusConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> StratusResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `STRATUS_*` environment variables
    pub fn apply_env(&mut self) -> StratusResult<()> {
        if let Ok(id) = std::env::var("STRATUS_NODE_ID") {
            self.node_id = id
                .parse()
                .map_err(|_| StratusError::ConfigError("Invalid STRATUS_NODE_ID".to_string()))?;
        }

        if let Ok(path) = std::env::var("STRATUS_DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(path);
        }

        self.agent.command_wait =
            parse_duration_secs_from_env("STRATUS_AGENT_COMMAND_WAIT_SECS", self.agent.command_wait);
        self.agent.probe_wait =
            parse_duration_secs_from_env("STRATUS_AGENT_PROBE_WAIT_SECS", self.agent.probe_wait);
        self.work.lock_wait =
            parse_duration_from_env("STRATUS_WORK_LOCK_WAIT_MS", self.work.lock_wait);
        self.recovery.scan_interval = parse_duration_secs_from_env(
            "STRATUS_RECOVERY_SCAN_INTERVAL_SECS",
            self.recovery.scan_interval,
        );

        if let Ok(retries) = std::env::var("STRATUS_PLACEMENT_MAX_RETRIES") {
            self.placement.max_retries = retries.parse().map_err(|_| {
                StratusError::ConfigError("Invalid STRATUS_PLACEMENT_MAX_RETRIES".to_string())
            })?;
        }

        if let Ok(enabled) = std::env::var("STRATUS_RECOVERY_ENABLED") {
            self.recovery.enabled = enabled.parse().map_err(|_| {
                StratusError::ConfigError("Invalid STRATUS_RECOVERY_ENABLED".to_string())
            })?;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> StratusResult<()> {
        if self.node_id == 0 {
            return Err(StratusError::ConfigError(
                "node_id must be non-zero".to_string(),
            ));
        }

        if self.agent.channel_depth == 0 {
            return Err(StratusError::ConfigError(
                "agent.channel_depth must be at least 1".to_string(),
            ));
        }

        if self.agent.probe_wait.is_zero() || self.agent.command_wait.is_zero() {
            return Err(StratusError::ConfigError(
                "agent wait budgets must be non-zero".to_string(),
            ));
        }

        if self.orchestrator.start_retries == 0 {
            return Err(StratusError::ConfigError(
                "orchestrator.start_retries must be at least 1".to_string(),
            ));
        }

        if self.placement.max_retries == 0 {
            return Err(StratusError::ConfigError(
                "placement.max_retries must be at least 1".to_string(),
            ));
        }

        if self.work.lock_wait.is_zero() {
            return Err(StratusError::ConfigError(
                "work.lock_wait must be non-zero".to_string(),
            ));
        }

        if self.recovery.enabled && self.recovery.scan_interval.is_zero() {
            return Err(StratusError::ConfigError(
                "recovery.scan_interval must be non-zero when recovery is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a test configuration with short wait budgets
    pub fn test() -> Self {
        let mut config = Self::default();
        config.node_id = 1;
        config.storage.database_path = PathBuf::from("/tmp/stratus-test.redb");
        config.agent.command_wait = duration_ms(500);
        config.agent.probe_wait = duration_ms(200);
        config.orchestrator.migrate_wait = duration_ms(500);
        config.orchestrator.storage_migrate_wait = duration_ms(500);
        config.orchestrator.start_wait = duration_ms(500);
        config.orchestrator.stop_wait = duration_ms(500);
        config.orchestrator.scale_wait = duration_ms(500);
        config.work.lock_wait = duration_ms(100);
        config.recovery.scan_interval = duration_ms(50);
        config
    }
}

/// Builder for StratusConfig
pub struct StratusConfigBuilder {
    config: StratusConfig,
}

impl StratusConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: StratusConfig::default(),
        }
    }

    pub fn node_id(mut self, id: u64) -> Self {
        self.config.node_id = id;
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage.database_path = path.into();
        self
    }

    pub fn agent(mut self, agent: AgentConfig) -> Self {
        self.config.agent = agent;
        self
    }

    pub fn orchestrator(mut self, orchestrator: OrchestratorConfig) -> Self {
        self.config.orchestrator = orchestrator;
        self
    }

    pub fn lock_wait(mut self, wait: Duration) -> Self {
        self.config.work.lock_wait = wait;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.placement.max_retries = retries;
        self
    }

    pub fn recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.config.recovery = recovery;
        self
    }

    pub fn build(self) -> StratusResult<StratusConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for StratusConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper functions for duration parsing
pub(crate) fn parse_duration_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

pub(crate) fn parse_duration_secs_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validation() {
        let mut config = StratusConfig::default();
        config.node_id = 1;
        assert!(config.validate().is_ok());
        assert_eq!(config.placement.max_retries, 2);
    }

    #[test]
    fn test_config_builder() {
        let config = StratusConfigBuilder::new()
            .node_id(42)
            .max_retries(3)
            .lock_wait(Duration::from_secs(2))
            .build()
            .unwrap();

        assert_eq!(config.node_id, 42);
        assert_eq!(config.placement.max_retries, 3);
        assert_eq!(config.work.lock_wait, Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_config() {
        let config = StratusConfig::default(); // node_id is 0
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_placement_retries_rejected() {
        let mut config = StratusConfig::test();
        config.placement.max_retries = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("placement.max_retries"));

        assert!(StratusConfigBuilder::new()
            .node_id(1)
            .max_retries(0)
            .build()
            .is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: StratusConfig = toml::from_str(
            r#"
            node_id = 7

            [orchestrator]
            migrate_wait = "10m"

            [work]
            lock_wait = "2s"
            "#,
        )
        .unwrap();

        assert_eq!(config.node_id, 7);
        assert_eq!(config.orchestrator.migrate_wait, Duration::from_secs(600));
        assert_eq!(
            config.orchestrator.start_wait,
            duration_secs(DEFAULT_START_WAIT_SECS)
        );
        assert_eq!(config.work.lock_wait, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }
}
