//! HTTP error types for the `ZVault` server.
//!
//! Maps [`CoreError`] into HTTP responses. Every error variant produces a
//! JSON body with a machine-readable `error` field and a human-readable
//! `message`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use zvault_core::error::{CoreError, LogicalError};

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// The vault is sealed — reject all secret operations.
    Sealed,
    /// Missing or wrong token.
    Forbidden(String),
    /// Requested resource not found.
    NotFound(String),
    /// Client sent invalid input.
    BadRequest(String),
    /// A conflict (e.g., already initialized).
    Conflict(String),
    /// No active node can serve the request right now.
    Unavailable(String),
    /// The active node could not be reached.
    BadGateway(String),
    /// Internal server error.
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::Sealed => (
                StatusCode::SERVICE_UNAVAILABLE,
                "sealed",
                "vault is sealed".to_owned(),
            ),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "permission_denied", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            Self::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "forward_failed", msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Sealed => Self::Sealed,
            CoreError::PermissionDenied => Self::Forbidden(err.to_string()),
            CoreError::AlreadyInitialized => Self::Conflict(err.to_string()),

            CoreError::NotInitialized
            | CoreError::ThresholdNotMet { .. }
            | CoreError::InvalidMasterKey
            | CoreError::Seal(_) => Self::BadRequest(err.to_string()),

            CoreError::LeaderUnavailable => Self::Unavailable(err.to_string()),
            CoreError::ForwardFailed { .. } => Self::BadGateway(err.to_string()),
            CoreError::Logical(inner) => inner.into(),

            CoreError::ListenerSetupFailed { .. }
            | CoreError::InvalidConfig { .. }
            | CoreError::Barrier(_)
            | CoreError::Cluster(_)
            | CoreError::Ha(_) => {
                tracing::error!(error = %err, "internal error");
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<LogicalError> for AppError {
    fn from(err: LogicalError) -> Self {
        match err {
            LogicalError::Sealed => Self::Sealed,
            LogicalError::InvalidRequest { .. } | LogicalError::UnsupportedOperation { .. } => {
                Self::BadRequest(err.to_string())
            }
            LogicalError::NotActive => Self::Unavailable(err.to_string()),
            LogicalError::Backend { .. } => Self::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(err: CoreError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn status_codes() {
        assert_eq!(status(CoreError::Sealed), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(CoreError::PermissionDenied), StatusCode::FORBIDDEN);
        assert_eq!(status(CoreError::AlreadyInitialized), StatusCode::CONFLICT);
        assert_eq!(status(CoreError::InvalidMasterKey), StatusCode::BAD_REQUEST);
        assert_eq!(status(CoreError::LeaderUnavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(CoreError::ForwardFailed {
                reason: "connection refused".to_owned()
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(CoreError::Logical(LogicalError::InvalidRequest {
                reason: "missing data".to_owned()
            })),
            StatusCode::BAD_REQUEST
        );
    }
}
