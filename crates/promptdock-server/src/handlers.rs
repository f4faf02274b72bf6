//! Public JSON edge: `/execute`, `/stop/:id`, `/status/:id`, and the proxied
//! `/runtime/:id/*` surface.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::Request;
use axum::response::Response;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use promptdock_runtime::{Runtime, RuntimeError, Supervisor};

use crate::api_errors::ApiError;
use crate::proxy::ProxyTable;

pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub proxy: Arc<ProxyTable>,
    pub public_base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub status: String,
    #[serde(rename = "executerID")]
    pub executer_id: String,
    pub title: String,
    pub url: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/stop/:id", post(stop))
        .route("/status/:id", get(status))
        .route("/runtime/*rest", any(proxy_runtime))
        .with_state(state)
}

async fn execute(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }
    let root = CancellationToken::new();
    let id = state
        .supervisor
        .new_concurrent_execution(&root, &request.prompt)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let runtime = state
        .supervisor
        .status(&id)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(ExecuteResponse {
        status: runtime.state.to_string(),
        executer_id: id.clone(),
        title: runtime.title,
        url: format!("{}/runtime/{id}", state.public_base_url),
    }))
}

async fn stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.supervisor.stop(&id).await.map_err(map_runtime_error)?;
    Ok(Json(json!({ "status": "stopped" })))
}

async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Runtime>, ApiError> {
    let runtime = state.supervisor.status(&id).map_err(map_runtime_error)?;
    Ok(Json(runtime))
}

/// `/runtime/<id>` and everything under it. The id is resolved against the
/// proxy table per request, so register/deregister never touch the router.
async fn proxy_runtime(
    State(state): State<Arc<AppState>>,
    Path(rest): Path<String>,
    request: Request<Body>,
) -> Response {
    let (id, path) = match rest.split_once('/') {
        Some((id, path)) => (id.to_string(), path.to_string()),
        None => (rest, String::new()),
    };
    state.proxy.forward(&id, &path, request).await
}

fn map_runtime_error(e: RuntimeError) -> ApiError {
    match e {
        RuntimeError::NotFound(_) => ApiError::not_found(e.to_string()),
        other => ApiError::internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::{Method, StatusCode};
    use tower::ServiceExt;

    use promptdock_runtime::llm::testing::ScriptedModel;
    use promptdock_runtime::{RecordStore, RuntimeRegistry};
    use promptdock_sandbox::testing::{ScriptedBehavior, ScriptedFactory};

    fn test_state(dir: &tempfile::TempDir) -> Arc<AppState> {
        let proxy = Arc::new(ProxyTable::new());
        let supervisor = Arc::new(Supervisor::new(
            RuntimeRegistry::new(),
            Arc::new(ScriptedModel::repeating("no code")),
            Arc::new(ScriptedFactory::repeating(ScriptedBehavior::silent())),
            proxy.clone(),
            RecordStore::new(dir.path()),
            "http://localhost:0",
        ));
        Arc::new(AppState {
            supervisor,
            proxy,
            public_base_url: "http://localhost:0".to_string(),
        })
    }

    #[tokio::test]
    async fn status_of_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = build_router(test_state(&dir));
        let request = Request::builder()
            .method(Method::GET)
            .uri("/status/deadbeef")
            .body(Body::empty())
            .expect("request");
        let response = router.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stop_of_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = build_router(test_state(&dir));
        let request = Request::builder()
            .method(Method::POST)
            .uri("/stop/deadbeef")
            .body(Body::empty())
            .expect("request");
        let response = router.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn execute_rejects_empty_prompt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = build_router(test_state(&dir));
        let request = Request::builder()
            .method(Method::POST)
            .uri("/execute")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "prompt": "  " }).to_string()))
            .expect("request");
        let response = router.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unrouted_runtime_path_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = build_router(test_state(&dir));
        let request = Request::builder()
            .method(Method::GET)
            .uri("/runtime/deadbeef/index.html")
            .body(Body::empty())
            .expect("request");
        let response = router.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
