//! Logical routes: `/v1/{*path}`
//!
//! Every path outside `/v1/sys` becomes a logical [`Request`] handed to the
//! core, which executes it locally or forwards it to the active node.
//!
//! - `GET    /v1/{*path}` — read (`?list=true` lists children)
//! - `PUT`/`POST /v1/{*path}` — write the JSON body
//! - `DELETE /v1/{*path}` — delete

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::any;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use crate::error::AppError;
use crate::routes::client_token;
use crate::state::AppState;
use zvault_core::{Operation, Request};

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/{*path}", any(handle))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogicalQuery {
    #[serde(default)]
    pub list: bool,
}

fn operation_for(method: &Method, list: bool) -> Result<Operation, AppError> {
    match *method {
        Method::GET if list => Ok(Operation::List),
        Method::GET => Ok(Operation::Read),
        Method::PUT | Method::POST => Ok(Operation::Update),
        Method::DELETE => Ok(Operation::Delete),
        _ => Err(AppError::BadRequest(format!("method {method} is not supported"))),
    }
}

fn parse_body(body: &Bytes) -> Result<Option<BTreeMap<String, Value>>, AppError> {
    if body.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| AppError::BadRequest(format!("request body must be a JSON object: {e}")))
}

async fn handle(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<LogicalQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<HttpResponse, AppError> {
    if path.contains('\0') {
        return Err(AppError::BadRequest(
            "null bytes are not allowed in paths".to_owned(),
        ));
    }

    let operation = operation_for(&method, query.list)?;
    let mut request = Request::new(operation, path);
    if let Some(token) = client_token(&headers) {
        request = request.with_token(token);
    }
    if operation == Operation::Update {
        if let Some(data) = parse_body(&body)? {
            request = request.with_data(data);
        }
    }

    let response = state.core.handle_request(&request).await?;
    match (operation, response.data) {
        (Operation::Read, None) => Err(AppError::NotFound(format!(
            "no entry at '{}'",
            request.path
        ))),
        (_, Some(data)) => Ok(Json(serde_json::json!({ "data": data })).into_response()),
        (_, None) => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
