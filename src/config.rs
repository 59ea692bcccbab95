// src/config.rs

//! Configuration loading utilities.
//!
//! Resolves which `engine.toml` to read, applies command-line overrides and
//! validates the result before the engine is built from it.

use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::models::{Config, StorageConfig};

/// File read when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "engine.toml";

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "ADVISORY_CONFIG";

/// Explicit path, then `ADVISORY_CONFIG`, then `engine.toml`.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    pick_path(explicit, std::env::var(CONFIG_ENV).ok())
}

fn pick_path(explicit: Option<&Path>, env: Option<String>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| env.filter(|v| !v.trim().is_empty()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load configuration from a TOML file.
///
/// A missing file falls back to defaults; a file that exists but does not
/// parse is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        log::warn!("Config not found at {:?}, using defaults", path);
        return Ok(Config::default());
    }
    Config::load(path)
        .map_err(|e| AppError::config(format!("Failed to load {}: {e}", path.display())))
}

/// Load, apply a storage directory override and validate.
pub fn load_all(path: &Path, storage_dir: Option<&Path>) -> Result<Config> {
    let mut config = load_config(path)?;
    if let Some(dir) = storage_dir {
        config.storage = StorageConfig::Local {
            root_dir: dir.to_string_lossy().into_owned(),
        };
    }
    config
        .validate()
        .map_err(|e| AppError::config(format!("Invalid configuration: {e}")))?;
    Ok(config)
}
