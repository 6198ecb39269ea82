use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides `index_sync.tick_interval_ms`.
pub const INDEX_TICK_ENV: &str = "SESSIOND_INDEX_TICK_MS";

const DEFAULT_CONFIG_YAML: &str = include_str!("../sessiond.yaml");

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub index_sync: IndexSyncConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DispatcherConfig {
    /// OS type reported in the system-info reply.
    #[serde(default = "default_os_type")]
    pub os_type: i32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            os_type: default_os_type(),
        }
    }
}

fn default_os_type() -> i32 {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// How long `release` waits for a session's `on_detach`.
    #[serde(default = "default_detach_timeout_ms")]
    pub detach_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            detach_timeout_ms: default_detach_timeout_ms(),
        }
    }
}

fn default_detach_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IndexSyncConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Upper bound on one bulk request body.
    #[serde(default = "default_bulk_buffer_bytes")]
    pub bulk_buffer_bytes: usize,
    /// Deadline for the catalog version refresh.
    #[serde(default = "default_catalog_timeout_ms")]
    pub catalog_timeout_ms: u64,
    /// Rows per getmore, `-1` for the data node's default.
    #[serde(default = "default_getmore_batch")]
    pub getmore_batch: i32,
}

impl IndexSyncConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_millis(self.catalog_timeout_ms)
    }
}

impl Default for IndexSyncConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            bulk_buffer_bytes: default_bulk_buffer_bytes(),
            catalog_timeout_ms: default_catalog_timeout_ms(),
            getmore_batch: default_getmore_batch(),
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_bulk_buffer_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_catalog_timeout_ms() -> u64 {
    1000
}

fn default_getmore_batch() -> i32 {
    -1
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct JournalConfig {
    /// Directory for `events.jsonl`. No journal when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `session_core=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        Ok(config.with_env_overrides())
    }

    /// The embedded defaults, with environment overrides applied.
    pub fn builtin() -> Result<Self> {
        let config = Self::from_yaml(DEFAULT_CONFIG_YAML)
            .context("Failed to parse embedded sessiond.yaml")?;
        Ok(config.with_env_overrides())
    }

    fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.index_sync.tick_interval_ms == 0 {
            anyhow::bail!("index_sync.tick_interval_ms must be greater than zero");
        }
        if self.index_sync.bulk_buffer_bytes == 0 {
            anyhow::bail!("index_sync.bulk_buffer_bytes must be greater than zero");
        }
        Ok(())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Some(tick) = std::env::var(INDEX_TICK_ENV)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|tick| *tick > 0)
        {
            self.index_sync.tick_interval_ms = tick;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn test_builtin_matches_defaults() {
        std::env::remove_var(INDEX_TICK_ENV);
        let config = NodeConfig::builtin().expect("builtin config");

        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.index_sync.tick_interval(), Duration::from_secs(1));
        assert!(config.journal.dir.is_none());
    }

    #[test]
    #[serial]
    fn test_load_partial_file_keeps_defaults() {
        std::env::remove_var(INDEX_TICK_ENV);
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "index_sync:\n  bulk_buffer_bytes: 1024\nlogging:\n  json: true").expect("write");

        let config = NodeConfig::load(file.path()).expect("load");
        assert_eq!(config.index_sync.bulk_buffer_bytes, 1024);
        assert_eq!(config.index_sync.tick_interval_ms, 1000);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        let err = NodeConfig::from_yaml("timers:\n  tick: 5\n").unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_zero_tick_is_rejected() {
        let err = NodeConfig::from_yaml("index_sync:\n  tick_interval_ms: 0\n").unwrap_err();
        assert!(err.to_string().contains("tick_interval_ms"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_tick_interval() {
        std::env::set_var(INDEX_TICK_ENV, "250");
        let config = NodeConfig::builtin().expect("builtin config");
        std::env::remove_var(INDEX_TICK_ENV);

        assert_eq!(config.index_sync.tick_interval_ms, 250);
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_is_ignored() {
        std::env::set_var(INDEX_TICK_ENV, "soon");
        let config = NodeConfig::builtin().expect("builtin config");
        std::env::remove_var(INDEX_TICK_ENV);

        assert_eq!(config.index_sync.tick_interval_ms, 1000);
    }
}
