use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{plog_debug, Error, Result};

pub const DEFAULT_BASE_PORT: u16 = 8888;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_MODEL_DIR: &str = "/models";
pub const DEFAULT_TAIL_LINES: usize = 50;

/// Isolated runtime for one model, as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentEntry {
    /// Root of the isolated runtime (a virtualenv-style directory).
    pub root: String,
    /// Interpreter or worker binary. Defaults to `<root>/bin/python`.
    #[serde(default)]
    pub executable: Option<String>,
    /// Extra variables set for this model's workers.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Shared model cache, also passed to workers as `--model-dir`.
    #[serde(default = "default_model_dir")]
    pub model_dir: String,
    /// Arguments placed before the rendered options, e.g. the inference script.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentEntry>,
}

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_model_dir() -> String {
    DEFAULT_MODEL_DIR.to_string()
}

fn default_tail_lines() -> usize {
    DEFAULT_TAIL_LINES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            model_dir: default_model_dir(),
            entrypoint: Vec::new(),
            tail_lines: DEFAULT_TAIL_LINES,
            environments: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn pipevisor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".pipevisor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::pipevisor_dir()?.join("pipevisor.toml"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn model_dir_path(&self) -> PathBuf {
        expand_tilde(&self.model_dir)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        plog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            plog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        plog_debug!(
            "Config loaded: base_port={}, poll_interval_secs={}, environments={:?}",
            config.base_port,
            config.poll_interval_secs,
            config.environments.keys().collect::<Vec<_>>()
        );
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(Error::Validation(
                "poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
