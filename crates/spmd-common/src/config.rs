//! Configuration types for spmd
//!
//! Loaded from a TOML file. Every field has a default so a partial file,
//! or no file at all, yields a usable configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for spmd
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Mailbox configuration
    #[serde(default)]
    pub mailbox: MailboxConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Configuration(e.to_string()))
    }
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per storage domain
    #[serde(default = "default_repository")]
    pub repository: PathBuf,
    /// Directory holding the per-pool reconnect records of this host
    #[serde(default = "default_pools_data_dir")]
    pub pools_data_dir: PathBuf,
    /// Open raw regions with `O_DIRECT`
    #[serde(default = "default_direct_io")]
    pub direct_io: bool,
    /// Maximum number of domains attached to one pool
    #[serde(default = "default_max_domains")]
    pub max_domains_in_pool: usize,
}

fn default_repository() -> PathBuf {
    PathBuf::from("/var/lib/spmd/domains")
}

fn default_pools_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/spmd/pools")
}

const fn default_direct_io() -> bool {
    true
}

const fn default_max_domains() -> usize {
    100
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            repository: default_repository(),
            pools_data_dir: default_pools_data_dir(),
            direct_io: default_direct_io(),
            max_domains_in_pool: default_max_domains(),
        }
    }
}

/// Mailbox monitor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Start mailbox monitors for block-based masters
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Sleep between two monitor passes
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Worker threads of each dispatch pool
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
    /// Bounded queue depth of each dispatch pool
    #[serde(default = "default_dispatch_queue_depth")]
    pub dispatch_queue_depth: usize,
    /// Number of host mailboxes scanned by the SPM
    #[serde(default = "default_max_hosts")]
    pub max_hosts: u32,
    /// Consecutive monitor failures tolerated before backing off
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Back-off after too many consecutive failures
    #[serde(default = "default_failure_backoff_secs")]
    pub failure_backoff_secs: u64,
}

const fn default_enabled() -> bool {
    true
}

const fn default_monitor_interval_ms() -> u64 {
    2000
}

const fn default_dispatch_workers() -> usize {
    5
}

const fn default_dispatch_queue_depth() -> usize {
    64
}

const fn default_max_hosts() -> u32 {
    250
}

const fn default_max_consecutive_failures() -> u32 {
    10
}

const fn default_failure_backoff_secs() -> u64 {
    60
}

impl MailboxConfig {
    #[must_use]
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    #[must_use]
    pub const fn failure_backoff(&self) -> Duration {
        Duration::from_secs(self.failure_backoff_secs)
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            monitor_interval_ms: default_monitor_interval_ms(),
            dispatch_workers: default_dispatch_workers(),
            dispatch_queue_depth: default_dispatch_queue_depth(),
            max_hosts: default_max_hosts(),
            max_consecutive_failures: default_max_consecutive_failures(),
            failure_backoff_secs: default_failure_backoff_secs(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.storage.max_domains_in_pool, 100);
        assert_eq!(config.mailbox.dispatch_workers, 5);
        assert_eq!(config.mailbox.monitor_interval(), Duration::from_secs(2));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_config() {
        let config = Config::parse(
            r#"
            [storage]
            repository = "/srv/domains"
            direct_io = false

            [mailbox]
            max_hosts = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.repository, PathBuf::from("/srv/domains"));
        assert!(!config.storage.direct_io);
        assert_eq!(config.storage.pools_data_dir, default_pools_data_dir());
        assert_eq!(config.mailbox.max_hosts, 16);
        assert!(config.mailbox.enabled);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spmd.toml");
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\njson = true\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            Config::parse("[storage]\nmax_domains_in_pool = \"many\""),
            Err(Error::Configuration(_))
        ));
    }
}
