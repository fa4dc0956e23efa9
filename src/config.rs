use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::miner::{MaskSpec, MinerConfig};

/// Top-level config loaded from `metascope.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetascopeConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub miner: MinerConfig,
    #[serde(default)]
    pub masking: MaskingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Columnar,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_clickhouse_url")]
    pub clickhouse_url: String,
    #[serde(default = "default_clickhouse_user")]
    pub clickhouse_user: String,
    #[serde(default)]
    pub clickhouse_password: String,
    /// Rows buffered per entity class before a bulk insert fires.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_attribute_flush_interval")]
    pub attribute_flush_interval_secs: u64,
    /// Where slices that exhausted their flush retries are serialized.
    #[serde(default = "default_recovery_dir")]
    pub recovery_dir: PathBuf,
    /// Off routes key observations to the legacy attribute_values log.
    #[serde(default = "default_true")]
    pub attribute_catalog: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackend::Memory,
            clickhouse_url: default_clickhouse_url(),
            clickhouse_user: default_clickhouse_user(),
            clickhouse_password: String::new(),
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval(),
            attribute_flush_interval_secs: default_attribute_flush_interval(),
            recovery_dir: default_recovery_dir(),
            attribute_catalog: true,
        }
    }
}

impl StorageConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn attribute_flush_interval(&self) -> Duration {
        Duration::from_secs(self.attribute_flush_interval_secs)
    }
}

fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_clickhouse_user() -> String {
    "default".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_flush_interval() -> u64 {
    5
}

fn default_attribute_flush_interval() -> u64 {
    60
}

fn default_recovery_dir() -> PathBuf {
    PathBuf::from("./metascope-recovery")
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// HLL precision for every sketch in the process (4-18).
    #[serde(default = "default_hll_precision")]
    pub hll_precision: u8,
    #[serde(default = "default_max_samples")]
    pub max_samples_per_key: usize,
    /// 0 = unbounded; otherwise evict the oldest entity past the cap.
    #[serde(default)]
    pub max_entities_per_shard: usize,
    #[serde(default = "default_true")]
    pub mine_log_templates: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            hll_precision: default_hll_precision(),
            max_samples_per_key: default_max_samples(),
            max_entities_per_shard: 0,
            mine_log_templates: true,
        }
    }
}

fn default_hll_precision() -> u8 {
    crate::hll::DEFAULT_PRECISION
}

fn default_max_samples() -> usize {
    crate::models::keystate::DEFAULT_MAX_SAMPLES
}

/// Pre-masking patterns are data: an ordered list of named regex →
/// placeholder rewrites. An empty list means the bundled defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MaskingConfig {
    #[serde(default)]
    pub patterns: Vec<MaskSpec>,
}

impl MaskingConfig {
    pub fn specs(&self) -> Vec<MaskSpec> {
        if self.patterns.is_empty() {
            crate::miner::default_specs()
        } else {
            self.patterns.clone()
        }
    }
}

impl MetascopeConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't
    /// exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: MetascopeConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}
