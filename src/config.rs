//! Configuration for gavel, read from `gavel.toml`.
//!
//! Settings are layered file → environment → CLI. A missing file yields the
//! defaults, so only the stage commands are strictly required for `run`.
//!
//! # Configuration File Format
//!
//! ```toml
//! [store]
//! path = "state/pipeline.json"
//!
//! [lock]
//! path = "state/gavel.lock"
//! wait_secs = 0
//!
//! [policy]
//! max_retries = 3
//! run_timeout_secs = 3300
//! upload_drain_timeout_secs = 600
//! require_qc_pass = true
//! after_date = "2025-01-01"
//!
//! [stages]
//! timeout_secs = 7200
//! fatal_exit_codes = [78]
//! discover = ["python3", "stages/discover.py"]
//! download = ["python3", "stages/download.py"]
//! transcribe = ["python3", "stages/transcribe.py"]
//! quality_check = ["python3", "stages/qc.py"]
//! format = ["python3", "stages/format.py"]
//! upload = ["python3", "stages/upload.py"]
//!
//! [logging]
//! level = "info"
//! json = false
//! file = "logs/gavel.log"
//! ```

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use gavel_common::Stage;

/// Configuration problems that make a run impossible.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No command configured for the {0} stage (set [stages].{0} in gavel.toml)")]
    MissingStageCommand(Stage),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("Malformed gavel.toml: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("state/pipeline.json")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSection {
    #[serde(default = "default_lock_path")]
    pub path: PathBuf,
    /// How long to wait for a held lock before reporting busy.
    #[serde(default)]
    pub wait_secs: u64,
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("state/gavel.lock")
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            path: default_lock_path(),
            wait_secs: 0,
        }
    }
}

/// Retry and time budget policy for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySection {
    /// Total failed attempts allowed per item. The failure that brings an
    /// item's count to this value is permanent, so `1` means no retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Wall-clock budget for pulling new work.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// How long to wait for queued uploads once the runner is done.
    #[serde(default = "default_upload_drain_timeout_secs")]
    pub upload_drain_timeout_secs: u64,
    /// Skip formatted items whose transcript failed QC instead of uploading them.
    #[serde(default = "default_require_qc_pass")]
    pub require_qc_pass: bool,
    /// Items dated on or before this day are skipped at discovery.
    #[serde(default)]
    pub after_date: Option<NaiveDate>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_run_timeout_secs() -> u64 {
    55 * 60
}

fn default_upload_drain_timeout_secs() -> u64 {
    10 * 60
}

fn default_require_qc_pass() -> bool {
    true
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            run_timeout_secs: default_run_timeout_secs(),
            upload_drain_timeout_secs: default_upload_drain_timeout_secs(),
            require_qc_pass: default_require_qc_pass(),
            after_date: None,
        }
    }
}

/// External commands backing each stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesSection {
    /// Per-command timeout; the child is killed when it elapses.
    #[serde(default = "default_stage_timeout_secs")]
    pub timeout_secs: u64,
    /// Exit codes that abort the whole run instead of failing one item.
    #[serde(default = "default_fatal_exit_codes")]
    pub fatal_exit_codes: Vec<i32>,
    #[serde(default)]
    pub discover: Vec<String>,
    #[serde(default)]
    pub download: Vec<String>,
    #[serde(default)]
    pub transcribe: Vec<String>,
    #[serde(default)]
    pub quality_check: Vec<String>,
    #[serde(default)]
    pub format: Vec<String>,
    #[serde(default)]
    pub upload: Vec<String>,
}

fn default_stage_timeout_secs() -> u64 {
    2 * 60 * 60
}

fn default_fatal_exit_codes() -> Vec<i32> {
    // EX_CONFIG from sysexits.h
    vec![78]
}

impl Default for StagesSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_stage_timeout_secs(),
            fatal_exit_codes: default_fatal_exit_codes(),
            discover: Vec::new(),
            download: Vec::new(),
            transcribe: Vec::new(),
            quality_check: Vec::new(),
            format: Vec::new(),
            upload: Vec::new(),
        }
    }
}

impl StagesSection {
    pub fn command(&self, stage: Stage) -> &[String] {
        match stage {
            Stage::Discover => &self.discover,
            Stage::Download => &self.download,
            Stage::Transcribe => &self.transcribe,
            Stage::QualityCheck => &self.quality_check,
            Stage::Format => &self.format,
            Stage::Upload => &self.upload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Optional log file, rotated daily.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

/// Parsed `gavel.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GavelConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub stages: StagesSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl GavelConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config = toml::from_str(content).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file doesn't exist,
    /// then apply environment overrides.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Environment variables override file settings.
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("GAVEL_STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("GAVEL_LOCK_PATH") {
            self.lock.path = PathBuf::from(path);
        }
        if let Ok(value) = std::env::var("GAVEL_MAX_RETRIES") {
            self.policy.max_retries =
                value
                    .parse()
                    .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                        key: "GAVEL_MAX_RETRIES",
                        message: e.to_string(),
                    })?;
        }
        Ok(())
    }

    /// Resolve relative paths against `base` (the config file's directory).
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.store.path);
        resolve(&mut self.lock.path);
        if let Some(file) = self.logging.file.as_mut() {
            resolve(file);
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.policy.run_timeout_secs)
    }

    pub fn upload_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.policy.upload_drain_timeout_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock.wait_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stages.timeout_secs)
    }

    /// Error when the configuration cannot drive a run at all.
    pub fn require_runnable(&self) -> Result<(), ConfigError> {
        for stage in [
            Stage::Discover,
            Stage::Download,
            Stage::Transcribe,
            Stage::QualityCheck,
            Stage::Format,
            Stage::Upload,
        ] {
            if self.stages.command(stage).is_empty() {
                return Err(ConfigError::MissingStageCommand(stage));
            }
        }
        if self.policy.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "policy.max_retries",
                message: "counts the failed attempts allowed per item and must be at least 1"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = self.require_runnable() {
            warnings.push(e.to_string());
        }

        if self.policy.run_timeout_secs == 0 {
            warnings.push("policy.run_timeout_secs is 0: no work will be pulled".to_string());
        }

        if self.policy.upload_drain_timeout_secs == 0 {
            warnings.push(
                "policy.upload_drain_timeout_secs is 0: queued uploads will be left for the next run"
                    .to_string(),
            );
        }

        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }

        if self.store.path == self.lock.path {
            warnings.push("store.path and lock.path point at the same file".to_string());
        }

        warnings
    }
}
