// packages/uplink/src/utils/config.rs
//! Pipeline configuration
//!
//! Loaded with the `config` crate from an optional TOML file followed by
//! `UPLINK__SECTION__KEY` environment overrides. Every field has a default,
//! so an empty source set yields a usable configuration.

use crate::pipeline::coordinator::{BufferConfig, HeartbeatConfig};
use crate::upload::dispatcher::DispatcherConfig;
use crate::utils::errors::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "uplink.toml";

/// Environment variable overriding the config file path
pub const CONFIG_PATH_ENV: &str = "UPLINK_CONFIG";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub buffers: BufferConfig,
    pub dispatcher: DispatcherConfig,
    pub heartbeat: HeartbeatConfig,
}

/// On-disk layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for per-session logs, spilled frames and checkpoints
    pub root_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join("replay-uplink"),
        }
    }
}

impl StorageConfig {
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root_dir.join("sessions").join(session_id)
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.root_dir.join("sessions")
    }

    pub fn frames_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("frames")
    }

    pub fn pending_uploads_dir(&self) -> PathBuf {
        self.root_dir.join("pending_uploads")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root_dir.join("session_checkpoint.json")
    }
}

/// Ingestion service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Base URL of the ingestion API
    pub endpoint: String,

    /// Project key sent as `x-rejourney-key`
    pub project_key: Option<String>,

    /// Device upload token sent as `x-upload-token`
    pub upload_token: Option<String>,

    /// Per-request timeout (milliseconds)
    pub request_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:3000".to_string(),
            project_key: None,
            upload_token: None,
            request_timeout_ms: 30_000,
        }
    }
}

impl PipelineConfig {
    /// Load from `UPLINK_CONFIG` (or `uplink.toml`) plus environment overrides
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from a specific file (missing file is not an error)
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("UPLINK")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| PipelineError::ConfigError(format!("Failed to read config: {}", e)))?;

        let parsed: PipelineConfig = settings
            .try_deserialize()
            .map_err(|e| PipelineError::ConfigError(format!("Invalid config: {}", e)))?;

        parsed.validate()?;
        Ok(parsed)
    }

    /// Reject settings that would break the bounded-queue guarantees
    pub fn validate(&self) -> Result<()> {
        if self.ingest.endpoint.trim().is_empty() {
            return Err(PipelineError::ConfigError("ingest.endpoint cannot be empty".to_string()));
        }
        if self.buffers.ring_capacity == 0 {
            return Err(PipelineError::ConfigError("buffers.ring_capacity cannot be 0".to_string()));
        }
        if self.buffers.frame_queue_capacity == 0 {
            return Err(PipelineError::ConfigError(
                "buffers.frame_queue_capacity cannot be 0".to_string(),
            ));
        }
        if self.buffers.max_batch_bytes == 0 {
            return Err(PipelineError::ConfigError("buffers.max_batch_bytes cannot be 0".to_string()));
        }
        if self.dispatcher.max_concurrent_uploads == 0 {
            return Err(PipelineError::ConfigError(
                "dispatcher.max_concurrent_uploads cannot be 0".to_string(),
            ));
        }
        if self.dispatcher.circuit_failure_threshold == 0 {
            return Err(PipelineError::ConfigError(
                "dispatcher.circuit_failure_threshold cannot be 0".to_string(),
            ));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(PipelineError::ConfigError("heartbeat.interval_ms cannot be 0".to_string()));
        }
        Ok(())
    }
}
