//! TOML configuration for hostwatch.
//!
//! Layered model: compiled-in defaults, overridden by a config file located
//! via `--config`, the `HOSTWATCH_CONFIG` environment variable, or the
//! standard system path, in that order. CLI flags override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::ForestParams;

pub const CONFIG_ENV: &str = "HOSTWATCH_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/hostwatch/hostwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the hostwatch process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostwatchConfig {
    #[serde(default)]
    pub training: ForestParams,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HostwatchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded hostwatch configuration");
        Ok(config)
    }

    /// Reject values that would parse but cannot drive a run.
    pub fn validate(&self) -> Result<()> {
        self.training.validate().context("[training]")?;
        self.monitor.validate().context("[monitor]")?;
        Ok(())
    }

    /// Resolve the configuration for this run.
    ///
    /// An explicit path must load; the environment and system locations fall
    /// through to defaults when unreadable.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        Ok(Self::load_or_default())
    }

    /// Use the file named by `HOSTWATCH_CONFIG`, else
    /// `/etc/hostwatch/hostwatch.toml` if present, else compiled-in defaults.
    pub fn load_or_default() -> Self {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let system_path = Some(PathBuf::from(SYSTEM_CONFIG_PATH)).filter(|p| p.exists());

        Self::load_first(env_path.into_iter().chain(system_path)).unwrap_or_else(|| {
            debug!("no config file found, using compiled-in defaults");
            Self::default()
        })
    }

    /// First candidate that loads; the rest are logged and skipped.
    fn load_first(candidates: impl IntoIterator<Item = PathBuf>) -> Option<Self> {
        candidates.into_iter().find_map(|path| match Self::load(&path) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{:#}", e), "config file could not be loaded, trying next location");
                None
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Numeric telemetry fields used as features, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub fields: Vec<String>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            fields: crate::telemetry::HOST_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Location of the trained model artifact.
    pub path: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/model.json"),
        }
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// Where the monitored telemetry stream lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub kind: StreamKind,
    /// JSON-lines file path; ignored for the SQLite stream.
    pub path: PathBuf,
    /// Name used to key the SQLite stream's cursor.
    pub name: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            kind: StreamKind::Jsonl,
            path: PathBuf::from("data/log_stream.jsonl"),
            name: "telemetry".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// One JSON object per line in an append-only file.
    Jsonl,
    /// The `telemetry` table of the hostwatch database.
    Sqlite,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Polling and retry behaviour of the monitor loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between polls when the stream is healthy.
    pub poll_interval_secs: f64,
    /// First retry delay after a failed fetch.
    pub backoff_base_secs: f64,
    /// Ceiling for the doubled retry delay.
    pub backoff_max_secs: f64,
    /// Consecutive fetch failures tolerated before giving up. Unset retries forever.
    pub max_consecutive_errors: Option<u32>,
    /// Restore the cursor saved by a previous run instead of starting at 0.
    pub resume: bool,
    /// Also record NORMAL classifications in the alerts table.
    pub persist_normal: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2.0,
            backoff_base_secs: 5.0,
            backoff_max_secs: 60.0,
            max_consecutive_errors: None,
            resume: true,
            persist_normal: false,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        let poll = self.poll_interval()?;
        if poll.is_zero() {
            anyhow::bail!("poll_interval_secs must be greater than 0");
        }
        if self.backoff_base()?.is_zero() {
            anyhow::bail!("backoff_base_secs must be greater than 0");
        }
        self.backoff_max()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        secs("poll_interval_secs", self.poll_interval_secs)
    }

    pub fn backoff_base(&self) -> Result<Duration> {
        secs("backoff_base_secs", self.backoff_base_secs)
    }

    /// Never below [`MonitorConfig::backoff_base`].
    pub fn backoff_max(&self) -> Result<Duration> {
        Ok(secs("backoff_max_secs", self.backoff_max_secs)?.max(self.backoff_base()?))
    }
}

fn secs(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("{} must be a finite, non-negative number of seconds, got {}", name, value))
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding alerts, cursors, and the SQLite stream.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/hostwatch.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON log lines instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
