use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

fn default_num_nodes() -> usize {
    1
}

fn default_horizon_step() -> usize {
    2
}

fn default_host_threads() -> usize {
    2
}

fn default_idle_sleep_us() -> u64 {
    50
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Nodes of the in-process cluster.
    #[serde(default = "default_num_nodes")]
    pub num_nodes: usize,
    /// Task submissions between two horizons.
    #[serde(default = "default_horizon_step")]
    pub horizon_step: usize,
    /// Worker threads of each node's host queue.
    #[serde(default = "default_host_threads")]
    pub host_threads: usize,
    /// How long an idle executor sleeps between polls.
    #[serde(default = "default_idle_sleep_us")]
    pub idle_sleep_us: u64,
    /// Where to write the task and command graphs as DOT files at shutdown.
    pub graph_dump_dir: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_nodes: default_num_nodes(),
            horizon_step: default_horizon_step(),
            host_threads: default_host_threads(),
            idle_sleep_us: default_idle_sleep_us(),
            graph_dump_dir: None,
            debug: false,
        }
    }
}

impl Config {
    pub fn tessera_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".tessera"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::tessera_dir()?.join("tessera.toml"))
    }

    /// Load `~/.tessera/tessera.toml`, or the defaults if it does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading config");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            num_nodes = config.num_nodes,
            horizon_step = config.horizon_step,
            host_threads = config.host_threads,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 {
            return Err(Error::Validation("num_nodes must be at least 1".to_string()));
        }
        if self.horizon_step == 0 {
            return Err(Error::Validation("horizon_step must be at least 1".to_string()));
        }
        if self.host_threads == 0 {
            return Err(Error::Validation("host_threads must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_us)
    }

    pub fn graph_dump_path(&self) -> Option<PathBuf> {
        self.graph_dump_dir.as_deref().map(expand_tilde)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
