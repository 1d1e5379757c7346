use blockline_core::{
    BlockError, DEFAULT_MAX_TRANSFERS, HeartbeatOptions, PipelineOptions, Result,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub listen_addr: String,
    /// Address other nodes put in replica lists; defaults to `listen_addr`.
    #[serde(default)]
    pub advertise_addr: Option<String>,
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    pub data_dir: PathBuf,
    #[serde(default = "default_max_transfers")]
    pub max_transfers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_true")]
    pub checksums: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { checksums: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub url: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_pending_max_age_secs")]
    pub pending_max_age_secs: u64,
}

fn default_http_addr() -> String {
    "0.0.0.0:50075".to_string()
}

fn default_max_transfers() -> usize {
    DEFAULT_MAX_TRANSFERS
}

fn default_true() -> bool {
    true
}

fn default_ack_timeout_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    3_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_pending_max_age_secs() -> u64 {
    600
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("BLOCKLINE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| BlockError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BlockError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.listen_addr.trim().is_empty() {
            return Err(BlockError::Config("node.listen_addr is required".to_string()));
        }
        if self
            .node
            .advertise_addr
            .as_ref()
            .is_some_and(|value| value.trim().is_empty())
        {
            return Err(BlockError::Config(
                "node.advertise_addr must not be empty when set".to_string(),
            ));
        }
        if self.node.max_transfers == 0 {
            return Err(BlockError::Config(
                "node.max_transfers must be at least 1".to_string(),
            ));
        }
        if self.coordinator.url.trim().is_empty() {
            return Err(BlockError::Config("coordinator.url is required".to_string()));
        }
        if self.coordinator.heartbeat_interval_ms == 0 {
            return Err(BlockError::Config(
                "coordinator.heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn advertise_addr(&self) -> &str {
        self.node
            .advertise_addr
            .as_deref()
            .unwrap_or(&self.node.listen_addr)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            ack_timeout: Duration::from_millis(self.pipeline.ack_timeout_ms),
            connect_timeout: Duration::from_millis(self.pipeline.connect_timeout_ms),
        }
    }

    pub fn heartbeat_options(&self) -> HeartbeatOptions {
        HeartbeatOptions {
            interval: Duration::from_millis(self.coordinator.heartbeat_interval_ms),
            max_retries: self.coordinator.max_retries,
            pending_max_age: Duration::from_secs(self.coordinator.pending_max_age_secs),
            ..HeartbeatOptions::default()
        }
    }
}
