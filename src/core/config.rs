//! Optional per-store configuration (`fieldreq.toml`).
//!
//! A missing config file means defaults; a malformed one is a
//! `ValidationError` so silent misconfiguration cannot slip through.

use crate::core::error::FieldreqError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "fieldreq.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FieldreqConfig {
    /// Actor recorded on mutations when the CLI is not given `--actor`.
    #[serde(default)]
    pub default_actor: Option<String>,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Rebuild the snapshot automatically after every CLI write path.
    #[serde(default)]
    pub rebuild_on_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            rebuild_on_write: false,
        }
    }
}

/// Load config from `<root>/fieldreq.toml`. No file = defaults, not an error.
pub fn load_config(root: &Path) -> Result<FieldreqConfig, FieldreqError> {
    let config_path = root.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        return Ok(FieldreqConfig::default());
    }
    let content = fs::read_to_string(&config_path).map_err(FieldreqError::IoError)?;
    toml::from_str(&content).map_err(|e| FieldreqError::ValidationError(e.to_string()))
}
