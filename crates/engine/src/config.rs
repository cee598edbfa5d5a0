use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::EngineError;

fn secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

/// Engine settings.
///
/// Field names on the YAML side follow the config file format the engine has
/// always read:
///
/// ```yaml
/// data_dir: ./data
/// mem_table_size: 4194304   # bytes
/// level_size: 4             # tables per level before merging
/// max_level: 5
/// compact_interval: 10      # seconds
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding `wal.log` and `level/`.
    pub data_dir: PathBuf,

    /// Memtable size (bytes of values) that triggers a flush (default: 4MB)
    #[serde(rename = "mem_table_size")]
    pub flush_threshold: usize,

    /// Tables at one level that trigger a merge into the next (default: 4)
    #[serde(rename = "level_size")]
    pub level_threshold: usize,

    /// Highest level; tables here are never merged further (default: 5)
    pub max_level: usize,

    /// Background compaction period (default: 10s)
    #[serde(rename = "compact_interval", deserialize_with = "secs")]
    pub compaction_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            flush_threshold: 4 * 1024 * 1024, // 4MB
            level_threshold: 4,
            max_level: 5,
            compaction_interval: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn flush_threshold(mut self, bytes: usize) -> Self {
        self.flush_threshold = bytes;
        self
    }

    pub fn level_threshold(mut self, tables: usize) -> Self {
        self.level_threshold = tables;
        self
    }

    pub fn max_level(mut self, level: usize) -> Self {
        self.max_level = level;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Parses a YAML document. Missing keys take their defaults.
    pub fn from_yaml_str(s: &str) -> Result<Self, EngineError> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a YAML config file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| EngineError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(EngineError::InvalidConfig("data_dir is empty".into()));
        }
        if self.level_threshold == 0 {
            return Err(EngineError::InvalidConfig(
                "level_size must be at least 1".into(),
            ));
        }
        if self.compaction_interval.is_zero() {
            return Err(EngineError::InvalidConfig(
                "compact_interval must be positive".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn wal_path(&self) -> PathBuf {
        self.data_dir.join("wal.log")
    }
}
