//! OpenAI-compatible model listing

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use super::{blocking, modified_at, ApiError, ApiState};
use crate::types::model::ModelEntry;

const OWNER: &str = "llama-fleet";

pub fn router() -> Router<ApiState> {
    Router::new().route("/v1/models", get(list_models))
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelObject>,
}

#[derive(Debug, Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

impl ModelList {
    /// Models are listed under their alias when they have one
    pub fn from_entries(models: &[ModelEntry]) -> Self {
        Self {
            object: "list",
            data: models
                .iter()
                .map(|m| ModelObject {
                    id: m.display_id().to_string(),
                    object: "model",
                    created: modified_at(&m.path).timestamp(),
                    owned_by: OWNER,
                })
                .collect(),
        }
    }
}

pub(super) async fn list_models(State(state): State<ApiState>) -> Result<Json<ModelList>, ApiError> {
    let catalog = state.context()?.catalog().clone();
    let list = blocking(move || ModelList::from_entries(&catalog.list_models(false))).await?;
    Ok(Json(list))
}
