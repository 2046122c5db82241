//! Orchestrator configuration stored as TOML (default `vflow.toml`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Environment variable that overrides `max_debug_retries`.
pub const DEBUG_MAX_RETRIES_ENV: &str = "DEBUG_MAX_RETRIES";

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values a local run expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Debug rounds allowed per (node, failure reason) before the node fails.
    pub max_debug_retries: u32,

    /// Wall-clock budget for a whole run in seconds; `0` disables it.
    pub run_timeout_secs: u64,

    /// Idle wait between result polls in milliseconds.
    pub poll_interval_ms: u64,

    /// Root directory of the Task Memory audit trail.
    pub task_memory_root: PathBuf,

    /// Optional JSONL file receiving one event per transition and task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_path: Option<PathBuf>,

    /// Copy RTL/testbench sources into the stage directory when a stage fails.
    pub snapshot_failure_sources: bool,

    pub transport: TransportConfig,

    pub acceptance: AcceptanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// Redeliveries allowed after transient worker errors before dead-lettering.
    pub max_delivery_retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_delivery_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AcceptanceConfig {
    /// Downgrade missing coverage to warnings when simulation passed.
    pub relax_coverage_gating: bool,
}

impl Default for AcceptanceConfig {
    fn default() -> Self {
        Self {
            relax_coverage_gating: true,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_debug_retries: 2,
            run_timeout_secs: 30 * 60,
            poll_interval_ms: 100,
            task_memory_root: PathBuf::from("artifacts/task_memory"),
            events_path: None,
            snapshot_failure_sources: true,
            transport: TransportConfig::default(),
            acceptance: AcceptanceConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.task_memory_root.as_os_str().is_empty() {
            return Err(anyhow!("task_memory_root must be non-empty"));
        }
        Ok(())
    }

    /// Apply a `DEBUG_MAX_RETRIES` value; unparsable values are ignored.
    pub fn apply_debug_retries_override(&mut self, raw: Option<&str>) {
        let Some(raw) = raw else {
            return;
        };
        match raw.trim().parse::<u32>() {
            Ok(value) => {
                debug!(value, "max_debug_retries overridden from environment");
                self.max_debug_retries = value;
            }
            Err(_) => warn!(value = raw, "ignoring invalid {DEBUG_MAX_RETRIES_ENV}"),
        }
    }
}

/// Load config from a TOML file, then apply environment overrides.
///
/// If the file is missing, starts from `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    let mut cfg = read_config(path)?;
    let env_value = std::env::var(DEBUG_MAX_RETRIES_ENV).ok();
    cfg.apply_debug_retries_override(env_value.as_deref());
    cfg.validate()?;
    Ok(cfg)
}

fn read_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        return Ok(OrchestratorConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
