//! llama-fleet Library
//!
//! Local control plane for `llama-server` processes: GGUF discovery, per-model
//! process supervision and OpenAI/Ollama/LMStudio-compatible listeners.

pub mod api;
pub mod catalog;
pub mod context;
pub mod gguf;
pub mod lifecycle;
pub mod storage;
pub mod supervisor;
pub mod types;
