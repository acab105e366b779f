//! Configuration for the stageflow engine
//!
//! Engine settings live in a single TOML file. Every section and field has
//! a default, so a partial file (or none at all) is valid.
//!
//! # Config Location
//!
//! - **Linux**: `~/.config/stageflow/config.toml`
//! - **macOS**: `~/Library/Application Support/stageflow/config.toml`
//! - **Windows**: `%APPDATA%\stageflow\config.toml`
//!
//! # Example
//!
//! ```toml
//! [workers]
//! count = 4
//! pin_to_cpus = true
//!
//! [resources]
//! stage_slots = 32
//!
//! [logging]
//! filter = "info,stageflow=debug"
//! ```

use crate::error::{Result, StageflowError};
use crate::pipeline::{DispatcherConfig, ResourceSet, StagePolicy};
use crate::topology::{self, CpuHandle};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory name under the platform config directory
pub const APP_DIR: &str = "stageflow";

/// Config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Default tuples per output buffer
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Default scratch block size in bytes
pub const DEFAULT_SCRATCH_PAGE_SIZE: usize = 64 * 1024;

/// Get the default config file path
pub fn default_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_DIR).join(CONFIG_FILE))
}

// ==================== Sections ====================

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Number of worker threads; 0 means one per available CPU
    pub count: usize,

    /// Pin each worker to a CPU, round-robin
    pub pin_to_cpus: bool,

    /// CPUs to pin to; empty means every CPU the process may use
    pub cpus: Vec<CpuHandle>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 0,
            pin_to_cpus: false,
            cpus: Vec::new(),
        }
    }
}

/// Admission capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    pub stage_slots: u64,
    pub buffer_pages: u64,
    pub scratch_blocks: u64,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            stage_slots: 64,
            buffer_pages: 4096,
            scratch_blocks: 64,
        }
    }
}

/// Tuple buffer and scratch block sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Output capacity in tuples for packets that do not set one
    pub default_capacity: usize,

    /// Scratch block size in bytes
    pub page_size: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_BUFFER_CAPACITY,
            page_size: DEFAULT_SCRATCH_PAGE_SIZE,
        }
    }
}

/// Stage scheduling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Tuples an operator may process per step
    pub quantum_tuples: usize,

    pub stage_policy: StagePolicy,

    /// Packets that may exist at once
    pub max_packets: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            quantum_tuples: 256,
            stage_policy: StagePolicy::Reuse,
            max_packets: 1024,
        }
    }
}

/// Log output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,

    /// Also write daily rolling log files here
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            log_dir: None,
        }
    }
}

// ==================== Engine Config ====================

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: WorkerSettings,
    pub resources: ResourceSettings,
    pub buffers: BufferSettings,
    pub scheduler: SchedulerSettings,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| StageflowError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StageflowError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from `path`, or the default location when `None`, falling back
    /// to defaults if the file is missing or invalid
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_path() {
                Some(p) => p,
                None => return Self::default(),
            },
        };
        if !path.exists() {
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Write the config as TOML, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    StageflowError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| StageflowError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| StageflowError::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject values the dispatcher cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.resources.stage_slots == 0 {
            return Err(StageflowError::Config(
                "resources.stage_slots must be at least 1".to_string(),
            ));
        }
        if self.buffers.default_capacity == 0 || self.buffers.page_size == 0 {
            return Err(StageflowError::Config(
                "buffers.default_capacity and buffers.page_size must be non-zero".to_string(),
            ));
        }
        if self.scheduler.quantum_tuples == 0 {
            return Err(StageflowError::Config(
                "scheduler.quantum_tuples must be non-zero".to_string(),
            ));
        }
        if self.scheduler.max_packets == 0 || self.scheduler.max_packets == u32::MAX {
            return Err(StageflowError::Config(format!(
                "scheduler.max_packets {} out of range",
                self.scheduler.max_packets
            )));
        }
        Ok(())
    }

    /// Effective worker count
    pub fn worker_count(&self) -> usize {
        match self.workers.count {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        }
    }

    /// Build the dispatcher settings, resolving CPUs for pinning
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let cpus = if !self.workers.pin_to_cpus {
            Vec::new()
        } else if self.workers.cpus.is_empty() {
            topology::list_cpus()
        } else {
            self.workers.cpus.clone()
        };

        DispatcherConfig {
            workers: self.worker_count(),
            cpus,
            resources: ResourceSet::new(
                self.resources.stage_slots,
                self.resources.buffer_pages,
                self.resources.scratch_blocks,
            ),
            default_buffer_capacity: self.buffers.default_capacity,
            scratch_block_size: self.buffers.page_size,
            quantum_tuples: self.scheduler.quantum_tuples,
            stage_policy: self.scheduler.stage_policy,
            max_packets: self.scheduler.max_packets,
        }
    }
}
