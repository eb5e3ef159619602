use anyhow::{bail, Result};
use labchain_runtime::{ContainerConfig, DatasetConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "./labchain.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSettings,
    pub scheduler: SchedulerConfig,
    pub container: ContainerConfig,
    pub dataset: DatasetConfig,
    pub chain: ChainConfig,
    pub vault: VaultConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Holds the state snapshot and the content store.
    pub data_dir: PathBuf,
    /// Prefix of every algorithm image tag.
    pub image_prefix: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            image_prefix: "labchain".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub funding_threshold: u64,
    pub top_up_amount: u64,
    pub voting_duration_secs: u64,
    /// Lag between mining and event delivery on the in-process chain.
    pub event_delay_ms: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            funding_threshold: 1_000_000_000_000_000,
            top_up_amount: 10_000_000_000_000_000,
            voting_duration_secs: 3600,
            event_delay_ms: 20,
            backoff_base_secs: 1,
            backoff_max_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Hex-encoded 32-byte master secret, as written by `keygen`.
    pub master_secret_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 9184,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// One of `pretty`, `compact` or `json`.
    pub format: String,
    pub file_output: Option<PathBuf>,
    pub module_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_output: None,
            module_filters: HashMap::new(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        // Env overrides are left to the caller so it controls precedence
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Move the data directory, taking the dataset root along with it.
    pub fn set_data_dir(&mut self, data_dir: PathBuf) {
        self.dataset.storage_root = data_dir.join("datasets");
        self.node.data_dir = data_dir;
    }

    pub fn state_file(&self) -> PathBuf {
        self.node.data_dir.join("state.json")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.node.data_dir.join("blobs")
    }

    /// Apply `LABCHAIN_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(data_dir) = env::var("LABCHAIN_DATA_DIR") {
            if !data_dir.is_empty() {
                self.set_data_dir(PathBuf::from(data_dir));
            }
        }
        if let Ok(prefix) = env::var("LABCHAIN_IMAGE_PREFIX") {
            if !prefix.is_empty() {
                self.node.image_prefix = prefix;
            }
        }

        // Scheduler
        if let Some(v) = parsed("LABCHAIN_QUEUE_CAPACITY") {
            self.scheduler.queue_capacity = v;
        }
        if let Some(v) = parsed("LABCHAIN_MAX_CONCURRENT_TASKS") {
            self.scheduler.max_concurrent_tasks = v;
        }
        if let Some(v) = parsed("LABCHAIN_RESOLVE_GRACE_SECS") {
            self.scheduler.resolve_grace_secs = v;
        }
        if let Some(v) = parsed("LABCHAIN_RESOLVE_ELAPSED_ON_RECOVERY") {
            self.scheduler.resolve_elapsed_on_recovery = v;
        }

        // Container
        if let Ok(bin) = env::var("LABCHAIN_DOCKER_BIN") {
            if !bin.is_empty() {
                self.container.docker_bin = bin;
            }
        }
        if let Some(v) = parsed("LABCHAIN_CONTAINER_MEMORY_BYTES") {
            self.container.memory_bytes = v;
        }

        // Datasets
        if let Ok(root) = env::var("LABCHAIN_DATASET_ROOT") {
            if !root.is_empty() {
                self.dataset.storage_root = PathBuf::from(root);
            }
        }
        if let Some(v) = parsed("LABCHAIN_EXPORT_INTERVAL_SECS") {
            self.dataset.export_interval_secs = v;
        }
        if let Some(v) = parsed("LABCHAIN_CLEANUP_INTERVAL_SECS") {
            self.dataset.cleanup_interval_secs = v;
        }

        // Chain
        if let Some(v) = parsed("LABCHAIN_VOTING_DURATION_SECS") {
            self.chain.voting_duration_secs = v;
        }

        if let Ok(path) = env::var("LABCHAIN_VAULT_SECRET_FILE") {
            if !path.is_empty() {
                self.vault.master_secret_file = Some(PathBuf::from(path));
            }
        }

        // Metrics
        if let Some(v) = parsed("LABCHAIN_METRICS_ENABLED") {
            self.metrics.enabled = v;
        }
        if let Some(v) = parsed("LABCHAIN_METRICS_PORT") {
            self.metrics.port = v;
        }

        // Logging
        if let Ok(level) = env::var("LABCHAIN_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
        if let Ok(format) = env::var("LABCHAIN_LOG_FORMAT") {
            if !format.is_empty() {
                self.logging.format = format;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.queue_capacity == 0 {
            bail!("scheduler.queue_capacity must be at least 1");
        }
        if self.scheduler.max_concurrent_tasks == 0 {
            bail!("scheduler.max_concurrent_tasks must be at least 1");
        }
        if self.dataset.export_interval_secs == 0 || self.dataset.cleanup_interval_secs == 0 {
            bail!("dataset intervals must be positive");
        }
        if self.chain.backoff_base_secs == 0 {
            bail!("chain.backoff_base_secs must be positive");
        }
        if self.chain.backoff_base_secs > self.chain.backoff_max_secs {
            bail!(
                "chain.backoff_base_secs ({}) exceeds chain.backoff_max_secs ({})",
                self.chain.backoff_base_secs,
                self.chain.backoff_max_secs
            );
        }
        let prefix = &self.node.image_prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
        {
            bail!("node.image_prefix {:?} is not a valid image name", prefix);
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            bail!("logging.format must be pretty, compact or json");
        }
        Ok(())
    }
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
