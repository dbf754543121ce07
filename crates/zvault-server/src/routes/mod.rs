//! HTTP routes for the `ZVault` server.

pub mod logical;
pub mod sys;

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderMap, HeaderValue, header};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Header carrying the client token.
pub const TOKEN_HEADER: &str = "x-vault-token";

/// Build the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    // Concurrency-limit the sys routes (init/unseal) to prevent resource exhaustion.
    let sys_routes = Router::new()
        .nest("/v1/sys", sys::router())
        .layer(tower::limit::ConcurrencyLimitLayer::new(10));

    Router::new()
        .merge(sys_routes)
        .merge(logical::router())
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

/// The client token from the `X-Vault-Token` header, if present.
pub(crate) fn client_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}
