//! LMStudio-compatible listing endpoints

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use super::{blocking, openai, ApiError, ApiState};
use crate::supervisor::SlotPhase;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/api/v0/models", get(models))
        .route("/v1/models", get(openai::list_models))
}

#[derive(Debug, Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<LmStudioModel>,
}

#[derive(Debug, Serialize)]
struct LmStudioModel {
    id: String,
    object: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    publisher: String,
    arch: String,
    compatibility_type: &'static str,
    state: &'static str,
    max_context_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    loaded_context_length: Option<u64>,
}

async fn models(State(state): State<ApiState>) -> Result<Json<ModelList>, ApiError> {
    let context = state.context()?;
    let catalog = context.catalog().clone();
    let models = blocking(move || catalog.list_models(false)).await?;
    let supervisor = context.supervisor();
    let loaded = supervisor.get_loaded_processes();

    let data = models
        .iter()
        .map(|entry| {
            let process = loaded.get(&entry.model_id);
            let state = match (process, supervisor.phase(&entry.model_id)) {
                (Some(_), _) => "loaded",
                (None, SlotPhase::Loading) => "loading",
                _ => "not-loaded",
            };
            LmStudioModel {
                id: entry.display_id().to_string(),
                object: "model",
                kind: if entry.is_multimodal() { "vlm" } else { "llm" },
                publisher: "local".to_string(),
                arch: entry.primary.architecture.clone().unwrap_or_default(),
                compatibility_type: "gguf",
                state,
                max_context_length: entry.primary.context_length.unwrap_or_default(),
                loaded_context_length: process.and_then(|p| p.ctx_size()),
            }
        })
        .collect();

    Ok(Json(ModelList { object: "list", data }))
}
