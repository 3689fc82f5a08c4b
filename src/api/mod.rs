//! HTTP front ends
//!
//! Thin translations from the native, OpenAI, Ollama and LMStudio wire
//! shapes onto catalog and supervisor operations.

mod lmstudio;
mod native;
mod ollama;
mod openai;

use std::path::Path;
use std::sync::{Arc, Weak};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::context::AppContext;
use crate::storage::StorageError;
use crate::types::config::ListenerKind;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::ModelNotFound(_) => (StatusCode::NOT_FOUND, "MODEL_NOT_FOUND"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
            ApiError::Storage(_) | ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let body = ErrorBody {
            error: self.to_string(),
            code,
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

/// Router state: a weak handle, since the context owns the listeners
/// that own the routers.
#[derive(Clone)]
pub struct ApiState {
    context: Weak<AppContext>,
}

impl ApiState {
    pub fn new(context: Weak<AppContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> Result<Arc<AppContext>, ApiError> {
        self.context.upgrade().ok_or(ApiError::ShuttingDown)
    }
}

/// Routes served by the listener of `kind`
pub fn router(kind: ListenerKind, state: ApiState) -> Router {
    match kind {
        ListenerKind::Native => native::router().merge(openai::router()).with_state(state),
        ListenerKind::Ollama => ollama::router().with_state(state),
        ListenerKind::LmStudio => lmstudio::router().with_state(state),
    }
}

/// Run catalog I/O off the async workers
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Modification time of a model file, epoch when unavailable
fn modified_at(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::gguf::testing::ContainerBuilder;
    use crate::storage::settings::AppSettings;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    pub struct TestApp {
        pub _models: TempDir,
        pub context: Arc<AppContext>,
    }

    /// Context over a directory holding a text model and a vision model
    pub fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        ContainerBuilder::new()
            .string("general.architecture", "qwen3")
            .u32("qwen3.context_length", 40960)
            .write_to(&dir.path().join("qwen/Qwen3-8B-Q4_K_M.gguf"))
            .unwrap();
        ContainerBuilder::new()
            .string("general.architecture", "gemma3")
            .u32("gemma3.context_length", 131072)
            .write_to(&dir.path().join("gemma/gemma-3-4b-it-Q4_0.gguf"))
            .unwrap();
        ContainerBuilder::new()
            .string("general.architecture", "clip")
            .write_to(&dir.path().join("gemma/mmproj-gemma-3-4b-f16.gguf"))
            .unwrap();

        let settings = AppSettings {
            model_paths: vec![dir.path().to_path_buf()],
            llama_bin_dir: Some(dir.path().join("no-bin")),
            ..Default::default()
        };
        TestApp {
            _models: dir,
            context: AppContext::ephemeral(settings),
        }
    }

    impl TestApp {
        pub fn model_id(&self, name: &str) -> String {
            self.context
                .catalog()
                .list_models(false)
                .iter()
                .find(|m| m.name == name)
                .map(|m| m.model_id.clone())
                .unwrap()
        }

        pub async fn call(&self, kind: ListenerKind, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
            let app = router(kind, ApiState::new(Arc::downgrade(&self.context)));
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(match body {
                    Some(json) => Body::from(json.to_string()),
                    None => Body::empty(),
                })
                .unwrap();

            let response = app.oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let json = if bytes.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, json)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(ApiError::BadRequest("x".into()).into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::ModelNotFound("m".into()).into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Conflict("busy".into()).into_response().status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::ShuttingDown.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_dropped_context_is_unavailable() {
        let state = ApiState::new(Weak::new());
        assert!(matches!(state.context(), Err(ApiError::ShuttingDown)));
    }
}
