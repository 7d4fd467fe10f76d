use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::store::sqlite::PoolOptions;

const DEFAULT_DB_PATH: &str = "memory.db";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_path: PathBuf,
    pub pool_size: u32,
    pub busy_timeout_secs: u64,
}

impl Config {
    pub fn defaults() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DB_PATH),
            pool_size: 8,
            busy_timeout_secs: 10,
        }
    }

    /// Defaults, then the TOML file, then environment variables. CLI flags
    /// are applied by the caller on top.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::defaults();
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path(),
        };
        if let Some(path) = path {
            match read_config_file(&path, explicit.is_some())? {
                Some(file) => config.apply_toml_overrides(file),
                None => debug!("config: no file at {}", path.display()),
            }
        }
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("MEMORY_MCP_DB_PATH")
            && !value.trim().is_empty()
        {
            self.database_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("MEMORY_MCP_POOL_SIZE") {
            match value.parse() {
                Ok(parsed) => self.pool_size = parsed,
                Err(_) => warn!("config: ignoring MEMORY_MCP_POOL_SIZE={}", value),
            }
        }
        if let Ok(value) = std::env::var("MEMORY_MCP_BUSY_TIMEOUT") {
            match value.parse() {
                Ok(parsed) => self.busy_timeout_secs = parsed,
                Err(_) => warn!("config: ignoring MEMORY_MCP_BUSY_TIMEOUT={}", value),
            }
        }
    }

    fn apply_toml_overrides(&mut self, config: ConfigToml) {
        if let Some(value) = config.database_path {
            self.database_path = value;
        }
        if let Some(value) = config.pool_size {
            self.pool_size = value;
        }
        if let Some(value) = config.busy_timeout {
            self.busy_timeout_secs = value;
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_size: self.pool_size.max(1),
            busy_timeout: Duration::from_secs(self.busy_timeout_secs),
        }
    }
}

/// Keys mirror the environment variable names.
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    #[serde(rename = "MEMORY_MCP_DB_PATH")]
    database_path: Option<PathBuf>,
    #[serde(rename = "MEMORY_MCP_POOL_SIZE")]
    pool_size: Option<u32>,
    #[serde(rename = "MEMORY_MCP_BUSY_TIMEOUT")]
    busy_timeout: Option<u64>,
}

/// `<binary>.toml` next to the executable.
fn default_config_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let stem = exe.file_stem()?.to_str()?.to_string();
    Some(exe.parent()?.join(format!("{}.toml", stem)))
}

/// A missing or empty file yields `None`. An explicitly requested file must
/// exist.
fn read_config_file(path: &Path, required: bool) -> Result<Option<ConfigToml>> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        return Ok(None);
    }
    debug!("config: reading {}", path.display());
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    let parsed = toml::from_str(&content)
        .with_context(|| format!("invalid config TOML at {}", path.display()))?;
    Ok(Some(parsed))
}
