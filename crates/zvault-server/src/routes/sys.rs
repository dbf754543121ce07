//! System routes: `/v1/sys/*`
//!
//! Initialization, seal/unseal, step-down, and leader/cluster status.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::routes::client_token;
use crate::state::AppState;
use zvault_core::error::CoreError;
use zvault_core::{InitResponse, LeaderStatus, NodeState, Operation, Request, SealStatus};

/// Build the `/v1/sys` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/init", put(init))
        .route("/seal-status", get(seal_status))
        .route("/unseal", put(unseal))
        .route("/unseal-reset", put(unseal_reset))
        .route("/seal", put(seal))
        .route("/step-down", put(step_down))
        .route("/leader", get(leader))
        .route("/cluster", get(cluster))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub secret_shares: u8,
    pub secret_threshold: u8,
}

#[derive(Debug, Deserialize)]
pub struct UnsealRequest {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub reset: bool,
}

#[derive(Debug, Serialize)]
pub struct SealStatusResponse {
    #[serde(flatten)]
    pub status: SealStatus,
    pub state: NodeState,
}

#[derive(Debug, Serialize)]
pub struct ClusterResponse {
    pub cluster_name: String,
    pub cluster_id: String,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// Initialize the vault. Returns the unseal shares and root token once.
async fn init(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InitRequest>,
) -> Result<Json<InitResponse>, AppError> {
    let resp = state
        .core
        .initialize(body.secret_shares, body.secret_threshold)
        .await?;
    Ok(Json(resp))
}

async fn status_of(state: &AppState) -> Result<Json<SealStatusResponse>, AppError> {
    let status = state.core.seal_status().await?;
    Ok(Json(SealStatusResponse {
        status,
        state: state.core.state(),
    }))
}

async fn seal_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SealStatusResponse>, AppError> {
    status_of(&state).await
}

/// Submit one unseal share, or reset progress with `{"reset": true}`.
///
/// A share that leaves the vault short of its threshold is not an error
/// here; the response reports progress.
async fn unseal(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UnsealRequest>,
) -> Result<Json<SealStatusResponse>, AppError> {
    if body.reset {
        state.core.reset_unseal().await;
        return status_of(&state).await;
    }
    let key = body
        .key
        .ok_or_else(|| AppError::BadRequest("'key' is required".to_owned()))?;

    match state.core.unseal(&key).await {
        Ok(_) | Err(CoreError::ThresholdNotMet { .. }) => status_of(&state).await,
        Err(e) => Err(e.into()),
    }
}

async fn unseal_reset(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SealStatusResponse>, AppError> {
    state.core.reset_unseal().await;
    status_of(&state).await
}

/// Seal the vault. Requires the root token.
async fn seal(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let token = client_token(&headers).unwrap_or_default();
    state.core.seal(&token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Give up leadership. Requires the root token.
async fn step_down(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let mut request = Request::new(Operation::Update, "sys/step-down");
    if let Some(token) = client_token(&headers) {
        request = request.with_token(token);
    }
    state.core.step_down(&request).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn leader(State(state): State<Arc<AppState>>) -> Result<Json<LeaderStatus>, AppError> {
    Ok(Json(state.core.leader().await?))
}

async fn cluster(State(state): State<Arc<AppState>>) -> Result<Json<ClusterResponse>, AppError> {
    let cluster = state.core.cluster().await?;
    Ok(Json(ClusterResponse {
        cluster_name: cluster.name,
        cluster_id: cluster.id,
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use zvault_core::{Core, CoreConfig};
    use zvault_storage::MemoryBackend;

    use super::*;
    use crate::routes::{TOKEN_HEADER, router as app_router};

    fn app() -> Router {
        let core = Core::new(CoreConfig::new(Arc::new(MemoryBackend::new()), "127.0.0.1:8200"))
            .unwrap();
        app_router(Arc::new(AppState::new(core)))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = HttpRequest::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        let req = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn init_unseal_seal_flow() {
        let app = app();

        let (status, body) = call(&app, "GET", "/v1/sys/seal-status", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["initialized"], false);
        assert_eq!(body["state"], "sealed");

        let (status, init) = call(
            &app,
            "PUT",
            "/v1/sys/init",
            None,
            Some(json!({"secret_shares": 3, "secret_threshold": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let keys: Vec<String> = serde_json::from_value(init["keys"].clone()).unwrap();
        let root = init["root_token"].as_str().unwrap().to_owned();
        assert_eq!(keys.len(), 3);

        let (status, body) =
            call(&app, "PUT", "/v1/sys/unseal", None, Some(json!({"key": keys[0]}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sealed"], true);
        assert_eq!(body["progress"], 1);

        let (_, body) =
            call(&app, "PUT", "/v1/sys/unseal", None, Some(json!({"key": keys[1]}))).await;
        assert_eq!(body["sealed"], false);
        assert_eq!(body["state"], "active");

        let (status, body) = call(&app, "GET", "/v1/sys/cluster", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body["cluster_id"].as_str().unwrap().is_empty());

        let (status, _) = call(&app, "PUT", "/v1/sys/seal", Some("wrong"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&app, "PUT", "/v1/sys/seal", Some(root.as_str()), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&app, "GET", "/v1/sys/cluster", None, None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "sealed");
    }

    #[tokio::test]
    async fn unseal_reset_clears_progress() {
        let app = app();
        let (_, init) = call(
            &app,
            "PUT",
            "/v1/sys/init",
            None,
            Some(json!({"secret_shares": 3, "secret_threshold": 2})),
        )
        .await;
        let key = init["keys"][0].as_str().unwrap().to_owned();
        call(&app, "PUT", "/v1/sys/unseal", None, Some(json!({"key": key}))).await;

        let (status, body) = call(&app, "PUT", "/v1/sys/unseal-reset", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["progress"], 0);
    }

    #[tokio::test]
    async fn init_twice_conflicts() {
        let app = app();
        let body = json!({"secret_shares": 1, "secret_threshold": 1});
        call(&app, "PUT", "/v1/sys/init", None, Some(body.clone())).await;
        let (status, _) = call(&app, "PUT", "/v1/sys/init", None, Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn step_down_requires_token() {
        let app = app();
        let (_, init) = call(
            &app,
            "PUT",
            "/v1/sys/init",
            None,
            Some(json!({"secret_shares": 1, "secret_threshold": 1})),
        )
        .await;
        let key = init["keys"][0].as_str().unwrap().to_owned();
        call(&app, "PUT", "/v1/sys/unseal", None, Some(json!({"key": key}))).await;

        let (status, _) = call(&app, "PUT", "/v1/sys/step-down", None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let root = init["root_token"].as_str().unwrap();
        let (status, _) = call(&app, "PUT", "/v1/sys/step-down", Some(root), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, leader) = call(&app, "GET", "/v1/sys/leader", None, None).await;
        assert_eq!(leader["ha_enabled"], false);
        assert_eq!(leader["is_self"], true);
    }
}
