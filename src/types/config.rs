//! Configuration types
//!
//! Per-load launch options and listener kinds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Options for launching an inference server for one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchOptions {
    /// Context size to request (`None` = server default)
    pub ctx_size: Option<u32>,
    /// Number of layers to offload to the GPU
    pub gpu_layers: Option<u32>,
    /// Worker threads
    pub threads: Option<u32>,
    /// Logical batch size
    pub batch_size: Option<u32>,
    /// Physical batch size
    pub ubatch_size: Option<u32>,
    /// Parallel sequences
    pub parallel: Option<u32>,
    /// Flash attention on/off (`None` = server default)
    pub flash_attention: Option<bool>,
    /// Disable memory mapping of the weights
    pub no_mmap: bool,
    /// Lock weights in RAM
    pub mlock: bool,
    /// Use the model's Jinja chat template
    pub jinja: bool,
    /// Pass the multimodal projector when the model has one
    pub enable_vision: bool,
    /// Preferred port; falls back to the pool when busy
    pub port: Option<u16>,
    /// Additional raw arguments, shell-quoted
    pub extra_args: String,
    /// llama.cpp install to launch from, overriding the configured one
    pub llama_bin_dir: Option<PathBuf>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            ctx_size: None,
            gpu_layers: None,
            threads: None,
            batch_size: None,
            ubatch_size: None,
            parallel: None,
            flash_attention: None,
            no_mmap: false,
            mlock: false,
            jinja: true,
            enable_vision: true,
            port: None,
            extra_args: String::new(),
            llama_bin_dir: None,
        }
    }
}

/// Independently managed network listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    /// Management API plus OpenAI-compatible routes
    Native,
    Ollama,
    #[serde(rename = "lmstudio")]
    LmStudio,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Native => "native",
            Self::Ollama => "ollama",
            Self::LmStudio => "lmstudio",
        };
        f.write_str(name)
    }
}
