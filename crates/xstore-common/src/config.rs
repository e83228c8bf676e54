//! Configuration types for XStore
//!
//! This module defines the configuration tree consumed at startup by the
//! broker pool and the subsystems it owns. Every section defaults, so a
//! partial TOML file only needs to name the values it overrides.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for XStore
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database instance configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Broker pool configuration
    #[serde(default)]
    pub pool: PoolConfig,
    /// Transaction manager and log configuration
    #[serde(default)]
    pub transaction: TransactionConfig,
    /// Cache manager configuration
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_brokers == 0 {
            return Err(Error::configuration("pool.max_brokers must be at least 1"));
        }
        if self.transaction.max_active == 0 {
            return Err(Error::configuration(
                "transaction.max_active must be at least 1",
            ));
        }
        if self.transaction.max_flush_failures == 0 {
            return Err(Error::configuration(
                "transaction.max_flush_failures must be at least 1",
            ));
        }
        let threshold = self.cache.pressure_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::configuration(format!(
                "cache.pressure_threshold must be in (0, 1], got {threshold}"
            )));
        }
        Ok(())
    }

    /// Full path of the write-ahead log file
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.database.data_dir.join(&self.transaction.log_file)
    }
}

/// Database instance configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Directory holding the write-ahead log
    pub data_dir: PathBuf,
    /// Refuse all mutating transactions
    pub read_only: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./xstore-data"),
            read_only: false,
        }
    }
}

/// Broker pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of brokers built at startup
    pub max_brokers: usize,
    /// Default time `acquire` waits for a free broker (milliseconds)
    pub acquire_timeout_ms: u64,
}

impl PoolConfig {
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_brokers: 20,
            acquire_timeout_ms: 30_000,
        }
    }
}

/// When the log is forced to durable storage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Sync after every record (safest, slowest)
    Always,
    /// Sync when a transaction commits
    #[default]
    OnCommit,
    /// Never sync explicitly (fastest, commits are not durable)
    Never,
}

/// Transaction manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Log file name, relative to the data directory
    pub log_file: PathBuf,
    /// Sync mode for log writes
    pub sync_mode: SyncMode,
    /// Ceiling on concurrently ACTIVE transactions
    pub max_active: usize,
    /// Interval between background checkpoints (seconds, 0 = disabled)
    pub checkpoint_interval_secs: u64,
    /// Consecutive commit flush failures tolerated before the log is declared lost
    pub max_flush_failures: u32,
    /// Log size that makes the next checkpoint due early (bytes)
    pub max_log_size: u64,
}

impl TransactionConfig {
    /// Background checkpoint interval, `None` when disabled
    #[must_use]
    pub const fn checkpoint_interval(&self) -> Option<Duration> {
        if self.checkpoint_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.checkpoint_interval_secs))
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("transaction.wal"),
            sync_mode: SyncMode::OnCommit,
            max_active: 256,
            checkpoint_interval_secs: 300,
            max_flush_failures: 2,
            max_log_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// Cache manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory shared by all cache registrants (bytes)
    pub total_budget: u64,
    /// Usage / allocation ratio at which a registrant is asked to shrink
    pub pressure_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            total_budget: 64 * 1024 * 1024, // 64 MB
            pressure_threshold: 0.9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool.max_brokers, 20);
        assert_eq!(config.transaction.sync_mode, SyncMode::OnCommit);
        assert_eq!(
            config.transaction.checkpoint_interval(),
            Some(Duration::from_secs(300))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [pool]
            max_brokers = 4

            [transaction]
            sync_mode = "always"
            checkpoint_interval_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.max_brokers, 4);
        assert_eq!(config.pool.acquire_timeout_ms, 30_000);
        assert_eq!(config.transaction.sync_mode, SyncMode::Always);
        assert_eq!(config.transaction.checkpoint_interval(), None);
        assert_eq!(config.cache.total_budget, 64 * 1024 * 1024);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Config::from_toml_str("[pool]\nmax_brokers = 0\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = Config::from_toml_str("[cache]\npressure_threshold = 1.5\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xstore.toml");
        std::fs::write(&path, "[database]\nread_only = true\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.database.read_only);
        assert_eq!(
            config.log_path(),
            PathBuf::from("./xstore-data").join("transaction.wal")
        );
    }
}
