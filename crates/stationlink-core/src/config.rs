//! Configuration.
//!
//! Loaded from a JSON file where every field is optional, then overridden from
//! the environment:
//!
//! - `STATIONLINK_LOG_LEVEL`
//! - `STATIONLINK_DB_PATH`
//! - `STATIONLINK_BACKUP_DIR`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{DEFAULT_MAX_RETRIES, RetryEscalation};
use crate::error::ConfigError;

pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const ENV_LOG_LEVEL: &str = "STATIONLINK_LOG_LEVEL";
pub const ENV_DB_PATH: &str = "STATIONLINK_DB_PATH";
pub const ENV_BACKUP_DIR: &str = "STATIONLINK_BACKUP_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    pub dispatcher: DispatcherConfig,
    pub sessions: SessionConfig,
    pub recovery: RecoveryConfig,
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            dispatcher: DispatcherConfig::default(),
            sessions: SessionConfig::default(),
            recovery: RecoveryConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub default_timeout_secs: u64,
    pub max_retries: u32,
    /// How often expired sessions are swept.
    pub sweep_interval_secs: u64,
    /// Bounded wait for the queue pop and the inbound poll.
    pub poll_interval_ms: u64,
    /// How long `stop()` waits for background tasks.
    pub shutdown_grace_secs: u64,
    pub retry_escalation: RetryEscalation,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: crate::queue::DEFAULT_QUEUE_CAPACITY,
            default_timeout_secs: 30,
            max_retries: DEFAULT_MAX_RETRIES,
            sweep_interval_secs: 300,
            poll_interval_ms: 1000,
            shutdown_grace_secs: 5,
            retry_escalation: RetryEscalation::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: crate::domain::DEFAULT_SESSION_TIMEOUT.as_secs(),
        }
    }
}

impl SessionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub retry_max_retries: u32,
    pub retry_backoff_factor: f64,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_timeout_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry_max_retries: 3,
            retry_backoff_factor: 2.0,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout_secs: 60,
        }
    }
}

impl RecoveryConfig {
    pub fn breaker_recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.breaker_recovery_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    /// 0 disables automatic backups.
    pub auto_backup_interval_secs: u64,
    pub retention_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("stationlink.db"),
            backup_dir: PathBuf::from("backups"),
            auto_backup_interval_secs: 300,
            retention_days: 90,
        }
    }
}

impl StoreConfig {
    pub fn auto_backup_interval(&self) -> Option<Duration> {
        (self.auto_backup_interval_secs > 0)
            .then(|| Duration::from_secs(self.auto_backup_interval_secs))
    }
}

impl Config {
    /// Load from `path` if given (defaults otherwise), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override from environment variables, looked up through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(log_level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = log_level;
        }
        if let Some(db_path) = lookup(ENV_DB_PATH) {
            self.store.db_path = PathBuf::from(db_path);
        }
        if let Some(backup_dir) = lookup(ENV_BACKUP_DIR) {
            self.store.backup_dir = PathBuf::from(backup_dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.queue_capacity == 0 {
            return Err(ConfigError::Invalid("dispatcher.queue_capacity must be > 0".into()));
        }
        if self.dispatcher.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("dispatcher.poll_interval_ms must be > 0".into()));
        }
        if self.dispatcher.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("dispatcher.sweep_interval_secs must be > 0".into()));
        }
        if self.recovery.retry_backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "recovery.retry_backoff_factor must be >= 1.0".into(),
            ));
        }
        if self.recovery.breaker_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "recovery.breaker_failure_threshold must be > 0".into(),
            ));
        }
        Ok(())
    }
}
