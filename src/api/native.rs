//! Native management API

use std::path::PathBuf;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::{blocking, ApiError, ApiState};
use crate::context::ListenerStatus;
use crate::supervisor::{ProcessInfo, SlotPhase};
use crate::types::config::{LaunchOptions, ListenerKind};
use crate::types::model::ModelEntry;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/api/models/list", get(list_models))
        .route("/api/models/refresh", post(refresh_models))
        .route("/api/models/loaded", get(loaded_models))
        .route("/api/models/load", post(load_model))
        .route("/api/models/stop", post(stop_model))
        .route("/api/models/:id/console", get(model_console))
        .route("/api/model/alias/set", post(set_alias))
        .route("/api/setting", get(get_settings).post(update_settings))
        .route("/api/sys/compat", get(compat_status).post(set_compat))
        .route("/api/shutdown", post(shutdown))
}

/// Catalog entry plus its supervisor state
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelView {
    #[serde(flatten)]
    entry: ModelEntry,
    state: SlotPhase,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadRequest {
    model_id: String,
    #[serde(flatten)]
    options: LaunchOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelRequest {
    model_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AliasRequest {
    model_id: String,
    #[serde(default)]
    alias: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsRequest {
    model_paths: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SettingsView {
    model_paths: Vec<PathBuf>,
    llama_bin_dir: Option<PathBuf>,
    model_count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompatRequest {
    kind: ListenerKind,
    enable: bool,
    port: Option<u16>,
}

async fn list_models_with(state: &ApiState, force: bool) -> Result<Json<Vec<ModelView>>, ApiError> {
    let context = state.context()?;
    let catalog = context.catalog().clone();
    let models = blocking(move || catalog.list_models(force)).await?;

    let supervisor = context.supervisor();
    let views = models
        .iter()
        .map(|entry| ModelView {
            state: supervisor.phase(&entry.model_id),
            port: supervisor.get_port(&entry.model_id),
            entry: entry.clone(),
        })
        .collect();
    Ok(Json(views))
}

async fn list_models(State(state): State<ApiState>) -> Result<Json<Vec<ModelView>>, ApiError> {
    list_models_with(&state, false).await
}

async fn refresh_models(State(state): State<ApiState>) -> Result<Json<Vec<ModelView>>, ApiError> {
    list_models_with(&state, true).await
}

async fn loaded_models(State(state): State<ApiState>) -> Result<Json<Vec<ProcessInfo>>, ApiError> {
    let context = state.context()?;
    let mut loaded: Vec<ProcessInfo> = context
        .supervisor()
        .get_loaded_processes()
        .values()
        .map(|process| process.info())
        .collect();
    loaded.sort_by(|a, b| a.model_id.cmp(&b.model_id));
    Ok(Json(loaded))
}

async fn load_model(
    State(state): State<ApiState>,
    Json(request): Json<LoadRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let context = state.context()?;
    let catalog = context.catalog().clone();
    let supervisor = context.supervisor().clone();
    let LoadRequest { model_id, options } = request;

    let id = model_id.clone();
    let accepted = blocking(move || {
        catalog
            .find_model_by_id(&id)
            .map(|_| supervisor.load_model_async(&id, options))
    })
    .await?;

    match accepted {
        None => Err(ApiError::ModelNotFound(model_id)),
        Some(false) => Err(ApiError::Conflict(format!(
            "Model {} is already loading or running",
            model_id
        ))),
        Some(true) => Ok(Json(serde_json::json!({ "accepted": true, "modelId": model_id }))),
    }
}

async fn stop_model(
    State(state): State<ApiState>,
    Json(request): Json<ModelRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let context = state.context()?;
    let stopped = context.supervisor().stop(&request.model_id).await;
    Ok(Json(serde_json::json!({ "stopped": stopped, "modelId": request.model_id })))
}

async fn model_console(
    State(state): State<ApiState>,
    Path(model_id): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    let context = state.context()?;
    let catalog = context.catalog().clone();
    let name = model_id.clone();
    let model_id = blocking(move || catalog.find_model(&name).map(|m| m.model_id))
        .await?
        .unwrap_or(model_id);

    let process = context
        .supervisor()
        .process(&model_id)
        .ok_or(ApiError::ModelNotFound(model_id))?;
    Ok(Json(process.recent_output()))
}

async fn set_alias(
    State(state): State<ApiState>,
    Json(request): Json<AliasRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let context = state.context()?;
    let (model_id, alias) = (request.model_id.clone(), request.alias.clone());
    let updated = blocking(move || context.set_alias(&model_id, &alias)).await??;
    if !updated {
        return Err(ApiError::ModelNotFound(request.model_id));
    }
    Ok(Json(serde_json::json!({ "modelId": request.model_id, "alias": request.alias.trim() })))
}

async fn get_settings(State(state): State<ApiState>) -> Result<Json<SettingsView>, ApiError> {
    let context = state.context()?;
    let settings = context.settings();
    let catalog = context.catalog().clone();
    let model_count = blocking(move || catalog.list_models(false).len()).await?;
    Ok(Json(SettingsView {
        model_paths: settings.model_paths,
        llama_bin_dir: settings.llama_bin_dir,
        model_count,
    }))
}

async fn update_settings(
    State(state): State<ApiState>,
    Json(request): Json<SettingsRequest>,
) -> Result<Json<SettingsView>, ApiError> {
    let context = state.context()?;
    let ctx = context.clone();
    let (model_paths, model_count) = blocking(move || -> Result<_, ApiError> {
        let paths = ctx.set_model_paths(request.model_paths)?;
        Ok((paths, ctx.catalog().list_models(true).len()))
    })
    .await??;

    Ok(Json(SettingsView {
        model_paths,
        llama_bin_dir: context.settings().llama_bin_dir,
        model_count,
    }))
}

async fn compat_status(State(state): State<ApiState>) -> Result<Json<Vec<ListenerStatus>>, ApiError> {
    let context = state.context()?;
    let statuses = [ListenerKind::Native, ListenerKind::Ollama, ListenerKind::LmStudio]
        .into_iter()
        .map(|kind| context.listener_status(kind))
        .collect();
    Ok(Json(statuses))
}

async fn set_compat(
    State(state): State<ApiState>,
    Json(request): Json<CompatRequest>,
) -> Result<Json<ListenerStatus>, ApiError> {
    if request.kind == ListenerKind::Native {
        return Err(ApiError::BadRequest("the native listener cannot be toggled".into()));
    }
    let context = state.context()?;
    let status = context.set_compat(request.kind, request.enable, request.port)?;
    Ok(Json(status))
}

async fn shutdown(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, ApiError> {
    let context = state.context()?;
    tracing::info!("Shutdown requested over HTTP");
    context.request_shutdown();
    Ok(Json(serde_json::json!({ "ok": true })))
}
