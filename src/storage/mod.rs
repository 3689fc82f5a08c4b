//! Persistent storage
//!
//! This module handles persistence of settings: scan directories, aliases and listener ports.

pub mod settings;

use std::path::PathBuf;
use thiserror::Error;

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "LLAMA_FLEET_DATA_DIR";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not determine data directory")]
    NoDataDir,
}

/// Get the application data directory
///
/// Linux: ~/.local/share/llama-fleet
/// macOS: ~/Library/Application Support/dev.llama-fleet.llama-fleet
/// Windows: %APPDATA%/llama-fleet/llama-fleet/data
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    directories::ProjectDirs::from("dev", "llama-fleet", "llama-fleet")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
