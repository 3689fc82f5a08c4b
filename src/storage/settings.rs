//! Settings storage
//!
//! Manages persistence of scan directories, aliases and listener configuration.

use crate::storage::{get_data_dir, StorageError};
use crate::types::config::ListenerKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings of one optional compatibility listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatListenerSettings {
    pub enabled: bool,
    pub port: u16,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Directories scanned for GGUF files
    pub model_paths: Vec<PathBuf>,
    /// Directory containing the `llama-server` executable
    pub llama_bin_dir: Option<PathBuf>,
    /// Model id -> alias
    pub aliases: HashMap<String, String>,
    /// Address the listeners bind to
    pub host: String,
    /// Native API port
    pub port: u16,
    /// Ollama-compatible listener
    pub ollama: CompatListenerSettings,
    /// LMStudio-compatible listener
    pub lmstudio: CompatListenerSettings,
    /// First port handed to inference servers
    pub model_port_start: u16,
    /// Last port handed to inference servers
    pub model_port_end: u16,
    /// Catalog snapshot lifetime (0 = only rescan on demand)
    pub rescan_interval_secs: u64,
    /// Grace period between SIGTERM and SIGKILL when stopping a model
    pub stop_grace_secs: u64,
    /// Time a model may take to report its context size
    pub load_timeout_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model_paths: Vec::new(),
            llama_bin_dir: None,
            aliases: HashMap::new(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            ollama: CompatListenerSettings {
                enabled: false,
                port: 11434,
            },
            lmstudio: CompatListenerSettings {
                enabled: false,
                port: 1234,
            },
            model_port_start: 8081,
            model_port_end: 8180,
            rescan_interval_secs: 300,
            stop_grace_secs: 5,
            load_timeout_secs: 600,
        }
    }
}

impl AppSettings {
    /// Validate settings values
    ///
    /// Drops empty and duplicate model paths and repairs unusable ports.
    pub fn validate(&mut self) {
        let defaults = AppSettings::default();

        let mut seen: Vec<PathBuf> = Vec::new();
        self.model_paths.retain(|p| {
            let normalized = normalize_path(p);
            if normalized.as_os_str().is_empty() || seen.contains(&normalized) {
                return false;
            }
            seen.push(normalized);
            true
        });

        if self.port == 0 {
            self.port = defaults.port;
        }
        if self.ollama.port == 0 {
            self.ollama.port = defaults.ollama.port;
        }
        if self.lmstudio.port == 0 {
            self.lmstudio.port = defaults.lmstudio.port;
        }

        if self.model_port_start == 0 || self.model_port_start > self.model_port_end {
            tracing::warn!(
                "Invalid model port range {}-{}, using defaults",
                self.model_port_start,
                self.model_port_end
            );
            self.model_port_start = defaults.model_port_start;
            self.model_port_end = defaults.model_port_end;
        }

        if self.host.trim().is_empty() {
            self.host = defaults.host;
        }

        if self.stop_grace_secs == 0 {
            self.stop_grace_secs = defaults.stop_grace_secs;
        }
        if self.load_timeout_secs == 0 {
            self.load_timeout_secs = defaults.load_timeout_secs;
        }

        self.aliases.retain(|_, alias| !alias.trim().is_empty());
    }

    pub fn compat(&self, kind: ListenerKind) -> Option<&CompatListenerSettings> {
        match kind {
            ListenerKind::Native => None,
            ListenerKind::Ollama => Some(&self.ollama),
            ListenerKind::LmStudio => Some(&self.lmstudio),
        }
    }

    pub fn compat_mut(&mut self, kind: ListenerKind) -> Option<&mut CompatListenerSettings> {
        match kind {
            ListenerKind::Native => None,
            ListenerKind::Ollama => Some(&mut self.ollama),
            ListenerKind::LmStudio => Some(&mut self.lmstudio),
        }
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_secs > 0).then(|| Duration::from_secs(self.rescan_interval_secs))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

/// Trailing separators and `.` components removed, for duplicate detection.
fn normalize_path(path: &Path) -> PathBuf {
    path.components().collect()
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> AppSettings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            AppSettings::default()
        }
    }
}

/// Internal settings loading with error propagation
fn load_settings_from(path: &Path) -> Result<AppSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(AppSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: AppSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &AppSettings) -> Result<(), StorageError> {
    save_settings_to(&get_settings_path()?, settings)
}

fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
