//! Model types
//!
//! Defines container metadata and catalog entry structures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata extracted from one GGUF file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelContainerMetadata {
    /// File name without directory
    pub file_name: String,
    /// Absolute path to the GGUF file
    pub file_path: PathBuf,
    /// Value of `general.architecture`, if present
    pub architecture: Option<String>,
    /// First `*.context_length` value found
    pub context_length: Option<u64>,
}

/// A loadable model in the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    /// Stable identifier derived from the primary file path
    pub model_id: String,
    /// Display name (file stem without shard suffix)
    pub name: String,
    /// User-assigned alias, empty when unset
    pub alias: String,
    /// Primary weights
    pub primary: ModelContainerMetadata,
    /// Multimodal projector paired with the primary, if any
    pub mmproj: Option<ModelContainerMetadata>,
    /// Total bytes on disk, all shards included
    pub size: u64,
    /// Path passed to the inference server
    pub path: PathBuf,
}

impl ModelEntry {
    pub fn is_multimodal(&self) -> bool {
        self.mmproj.is_some()
    }

    /// Alias when set, otherwise the model id
    pub fn display_id(&self) -> &str {
        if self.alias.is_empty() {
            &self.model_id
        } else {
            &self.alias
        }
    }
}
