//! Startup configuration.
//!
//! The agent consumes a single JSON file at startup. Every section has
//! serde defaults so a minimal deployment config stays small; validation
//! happens after parsing and any violation is a startup error.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::rawdata::RawDataBufferConfig;

/// Configuration loading or validation failure. Fatal at startup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One signal source the deployment decodes from.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Interface id the decoder manifest refers to.
    pub interface_id: String,
    /// Source kind: `can`, `obd` or `custom`.
    pub kind: String,
    /// Device name or endpoint of the source, e.g. `can0`.
    #[serde(default)]
    pub device: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the decoded-signal queue feeding the inspection
    /// engine.
    #[serde(default = "default_signal_queue_size")]
    pub signal_queue_size: usize,
    /// Capacity of the triggered-data queue feeding the uploader.
    #[serde(default = "default_triggered_data_queue_size")]
    pub triggered_data_queue_size: usize,
}

const fn default_signal_queue_size() -> usize {
    10_000
}

const fn default_triggered_data_queue_size() -> usize {
    100
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            signal_queue_size: default_signal_queue_size(),
            triggered_data_queue_size: default_triggered_data_queue_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CampaignManagerConfig {
    /// Upper bound on one scheduler wait, so wall-clock jumps and stop
    /// requests are noticed in bounded time.
    #[serde(default = "default_idle_time_ms")]
    pub idle_time_ms: u64,
}

const fn default_idle_time_ms() -> u64 {
    1_000
}

impl Default for CampaignManagerConfig {
    fn default() -> Self {
        Self {
            idle_time_ms: default_idle_time_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckinConfig {
    #[serde(default = "default_checkin_interval_ms")]
    pub interval_ms: u64,
}

const fn default_checkin_interval_ms() -> u64 {
    120_000
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_checkin_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistencyConfig {
    /// Directory holding the persisted blobs.
    pub path: PathBuf,
    #[serde(default = "default_persistency_max_bytes")]
    pub max_bytes: u64,
}

const fn default_persistency_max_bytes() -> u64 {
    512 * 1024
}

/// Broker connection parameters, passed through to the transport
/// integration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub certificate_path: Option<PathBuf>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub root_ca_path: Option<PathBuf>,
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub raw_data: RawDataBufferConfig,
    #[serde(default)]
    pub campaign_manager: CampaignManagerConfig,
    #[serde(default)]
    pub checkin: CheckinConfig,
    #[serde(default)]
    pub persistency: Option<PersistencyConfig>,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl AgentConfig {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// I/O, parse and validation failures; all fatal at startup.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.signal_queue_size == 0 {
            return Err(ConfigError::Invalid("pipeline.signal_queue_size must be > 0".into()));
        }
        if self.pipeline.triggered_data_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.triggered_data_queue_size must be > 0".into(),
            ));
        }
        if self.campaign_manager.idle_time_ms == 0 {
            return Err(ConfigError::Invalid(
                "campaign_manager.idle_time_ms must be > 0".into(),
            ));
        }
        if self.checkin.interval_ms == 0 {
            return Err(ConfigError::Invalid("checkin.interval_ms must be > 0".into()));
        }
        if let Some(persistency) = &self.persistency {
            if persistency.path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("persistency.path must not be empty".into()));
            }
            if persistency.max_bytes == 0 {
                return Err(ConfigError::Invalid("persistency.max_bytes must be > 0".into()));
            }
        }
        for source in &self.sources {
            if !matches!(source.kind.as_str(), "can" | "obd" | "custom") {
                return Err(ConfigError::Invalid(format!(
                    "source {}: unknown kind {:?}",
                    source.interface_id, source.kind
                )));
            }
        }
        Ok(())
    }
}
