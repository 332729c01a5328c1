//! Engine configuration loading and config file resolution

use crate::definition::{validate_definitions, SourceDefinition};
use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "CRAGDATA_CONFIG";

/// Engine configuration loaded from a TOML file
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Cache directory; relative paths resolve against the config file location
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Source definitions in batch processing order
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceDefinition>,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

impl EngineConfig {
    /// Parse configuration text. Definition-set defects (duplicate names,
    /// undefined dependencies) fail the load.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        validate_definitions(&config.sources)?;
        Ok(config)
    }

    /// Load configuration from a file. A relative `cache_dir` resolves
    /// against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading engine configuration");
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&raw)?;
        if config.cache_dir.is_relative() {
            if let Some(parent) = path.parent() {
                config.cache_dir = parent.join(&config.cache_dir);
            }
        }
        Ok(config)
    }
}

/// Config file resolution following the priority order:
/// 1. Explicit path (highest priority)
/// 2. `CRAGDATA_CONFIG` environment variable
/// 3. Platform config directory (`<config_dir>/cragdata/cragdata.toml`)
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    // Priority 1: explicit path
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    // Priority 2: environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return Ok(PathBuf::from(path));
    }

    // Priority 3: platform default, only when it exists
    let default = dirs::config_dir().map(|dir| dir.join("cragdata").join("cragdata.toml"));
    match default {
        Some(path) if path.exists() => Ok(path),
        _ => Err(ConfigError::NotFound),
    }
}
