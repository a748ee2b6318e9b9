use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Program invoked for every job.
    #[serde(default = "default_tool")]
    pub tool: String,
    /// Time between the cooperative stop signal and the forced kill.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Overall deadline per job; 0 disables it.
    #[serde(default)]
    pub job_timeout_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_runner_channel_capacity")]
    pub runner_channel_capacity: usize,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_log_tail_bytes")]
    pub log_tail_bytes: usize,
    /// Maximum number of records kept; 0 keeps everything.
    #[serde(default)]
    pub retention_limit: usize,
    #[serde(default = "default_true")]
    pub remove_stale_output: bool,
    /// Put `-i <input>` ahead of the job's arguments.
    #[serde(default = "default_true")]
    pub insert_input_arg: bool,
    #[serde(default = "default_true")]
    pub append_output_path: bool,
    /// When set, job records are persisted under this directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_tool() -> String {
    "ffmpeg".to_string()
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_runner_channel_capacity() -> usize {
    256
}

fn default_max_line_bytes() -> usize {
    4096
}

fn default_log_tail_bytes() -> usize {
    16_384
}

fn default_true() -> bool {
    true
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            grace_period_ms: default_grace_period_ms(),
            job_timeout_secs: 0,
            event_capacity: default_event_capacity(),
            runner_channel_capacity: default_runner_channel_capacity(),
            max_line_bytes: default_max_line_bytes(),
            log_tail_bytes: default_log_tail_bytes(),
            retention_limit: 0,
            remove_stale_output: true,
            insert_input_arg: true,
            append_output_path: true,
            data_dir: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        if self.job_timeout_secs > 0 {
            Some(Duration::from_secs(self.job_timeout_secs))
        } else {
            None
        }
    }
}

fn read_config(path: &Path) -> Result<CoordinatorConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Load the config using this resolution order:
///   1. explicit path (must exist)
///   2. `TCOORD_CONFIG_DIR` environment variable
///   3. platform config dir (`<config_dir>/transcode-coordinator/config.json`)
///   4. defaults
pub fn load_config(config_path: Option<&Path>) -> Result<CoordinatorConfig> {
    if let Some(path) = config_path {
        if path.exists() {
            return read_config(path);
        }
        return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
    }

    if let Ok(config_dir) = std::env::var("TCOORD_CONFIG_DIR") {
        let path = PathBuf::from(config_dir).join("config.json");
        if path.exists() {
            return read_config(&path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("transcode-coordinator").join("config.json");
        if path.exists() {
            return read_config(&path);
        }
    }

    tracing::debug!("No config file found, using defaults");
    Ok(CoordinatorConfig::default())
}
