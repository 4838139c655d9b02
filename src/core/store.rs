//! Store abstraction for fieldreq state.
//!
//! A store is a directory holding the consolidated requirements database,
//! the broker/cache event logs, and the optional `fieldreq.toml` config.

use crate::core::error::FieldreqError;
use std::fs;
use std::path::{Path, PathBuf};

/// Handle to a fieldreq state workspace.
///
/// All subsystem state (payer requirements, org policies, audit ledger,
/// cache snapshots) is scoped to a store root.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
}

impl Store {
    /// Open a store at `root`, creating the directory if needed.
    pub fn open(root: &Path) -> Result<Self, FieldreqError> {
        fs::create_dir_all(root).map_err(FieldreqError::IoError)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }
}
