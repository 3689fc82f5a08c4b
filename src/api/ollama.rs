//! Ollama-compatible listing endpoints

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{blocking, modified_at, ApiError, ApiState};
use crate::types::model::ModelEntry;

/// Version reported to Ollama clients, which gate features on it
const COMPAT_VERSION: &str = "0.9.0";

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/api/tags", get(tags))
        .route("/api/ps", get(running))
        .route("/api/version", get(version))
}

#[derive(Debug, Serialize)]
struct TagList {
    models: Vec<Tag>,
}

#[derive(Debug, Serialize)]
struct Tag {
    name: String,
    model: String,
    modified_at: DateTime<Utc>,
    size: u64,
    digest: String,
    details: Details,
}

#[derive(Debug, Serialize)]
struct Details {
    format: &'static str,
    family: String,
    families: Vec<String>,
    parameter_size: String,
    quantization_level: String,
}

#[derive(Debug, Serialize)]
struct RunningList {
    models: Vec<RunningModel>,
}

#[derive(Debug, Serialize)]
struct RunningModel {
    name: String,
    model: String,
    size: u64,
    digest: String,
    details: Details,
    expires_at: DateTime<Utc>,
    size_vram: u64,
    context_length: u64,
}

/// Ollama names carry a tag; expose ours as `latest`
fn ollama_name(entry: &ModelEntry) -> String {
    format!("{}:latest", entry.display_id())
}

/// Stand-in digest, stable per model id
fn digest(entry: &ModelEntry) -> String {
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, entry.model_id.as_bytes());
    format!("{}{}", uuid.simple(), uuid.simple())
}

/// Quantization from the usual `-Q4_K_M` style file name suffix
fn quantization(entry: &ModelEntry) -> String {
    entry
        .name
        .rsplit(['-', '.'])
        .find(|part| {
            let upper = part.to_ascii_uppercase();
            upper.starts_with('Q') && upper[1..].starts_with(|c: char| c.is_ascii_digit())
                || upper.starts_with("IQ")
                || matches!(upper.as_str(), "F16" | "BF16" | "F32")
        })
        .map(str::to_ascii_uppercase)
        .unwrap_or_default()
}

fn details(entry: &ModelEntry) -> Details {
    let family = entry.primary.architecture.clone().unwrap_or_default();
    let mut families = vec![family.clone()];
    if entry.is_multimodal() {
        families.push("clip".to_string());
    }
    Details {
        format: "gguf",
        family,
        families,
        parameter_size: String::new(),
        quantization_level: quantization(entry),
    }
}

async fn tags(State(state): State<ApiState>) -> Result<Json<TagList>, ApiError> {
    let catalog = state.context()?.catalog().clone();
    let models = blocking(move || catalog.list_models(false)).await?;
    let models = models
        .iter()
        .map(|entry| Tag {
            name: ollama_name(entry),
            model: ollama_name(entry),
            modified_at: modified_at(&entry.path),
            size: entry.size,
            digest: digest(entry),
            details: details(entry),
        })
        .collect();
    Ok(Json(TagList { models }))
}

async fn running(State(state): State<ApiState>) -> Result<Json<RunningList>, ApiError> {
    let context = state.context()?;
    let catalog = context.catalog().clone();
    let models = blocking(move || catalog.list_models(false)).await?;
    let loaded = context.supervisor().get_loaded_processes();

    let models = models
        .iter()
        .filter_map(|entry| {
            let process = loaded.get(&entry.model_id)?;
            Some(RunningModel {
                name: ollama_name(entry),
                model: ollama_name(entry),
                size: entry.size,
                digest: digest(entry),
                details: details(entry),
                // Models stay loaded until stopped
                expires_at: process.started_at() + chrono::Duration::days(365),
                size_vram: entry.size,
                context_length: process.ctx_size().unwrap_or_default(),
            })
        })
        .collect();
    Ok(Json(RunningList { models }))
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "version": COMPAT_VERSION }))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::test_app;
    use super::*;
    use crate::types::config::ListenerKind::Ollama;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_tags() {
        let app = test_app();
        let (status, body) = app.call(Ollama, "GET", "/api/tags", None).await;
        assert_eq!(status, StatusCode::OK);

        let models = body["models"].as_array().unwrap();
        assert_eq!(models.len(), 2);
        let qwen = models
            .iter()
            .find(|m| m["name"].as_str().is_some_and(|n| n.starts_with("Qwen3-8B")))
            .unwrap();
        assert!(qwen["name"].as_str().unwrap().ends_with(":latest"));
        assert_eq!(qwen["details"]["format"], "gguf");
        assert_eq!(qwen["details"]["family"], "qwen3");
        assert_eq!(qwen["details"]["quantization_level"], "Q4_K_M");
        assert_eq!(qwen["digest"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_ps_lists_nothing_when_idle() {
        let app = test_app();
        let (status, body) = app.call(Ollama, "GET", "/api/ps", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["models"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_version() {
        let app = test_app();
        let (_, body) = app.call(Ollama, "GET", "/api/version", None).await;
        assert_eq!(body["version"], COMPAT_VERSION);
    }

    #[tokio::test]
    async fn test_native_routes_are_not_exposed() {
        let app = test_app();
        let (status, _) = app.call(Ollama, "GET", "/api/models/list", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_quantization_from_name() {
        let app = test_app();
        let models = app.context.catalog().list_models(false);
        let levels: Vec<String> = models.iter().map(quantization).collect();
        assert!(levels.contains(&"Q4_K_M".to_string()));
        assert!(levels.contains(&"Q4_0".to_string()));
    }
}
