//! API error types with HTTP response mapping.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reconciliation::ReconcileError;
use record_store::StoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Missing or unknown credentials.
    Unauthorized,
    /// Reconciliation engine error.
    Reconcile(ReconcileError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::Reconcile(err) => reconcile_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn reconcile_error_to_response(err: ReconcileError) -> (StatusCode, String) {
    match &err {
        ReconcileError::RecordNotFound(_) => {
            (StatusCode::NOT_FOUND, "Transaction not found".to_string())
        }
        ReconcileError::Store(StoreError::NotFound { kind, .. }) => {
            (StatusCode::NOT_FOUND, format!("{kind} not found"))
        }
        ReconcileError::InvalidTransition { .. } | ReconcileError::StoreConflict { .. } => {
            (StatusCode::CONFLICT, err.to_string())
        }
        _ => {
            tracing::error!(error = %err, "reconciliation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        ApiError::Reconcile(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Reconcile(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{RecordId, RecordKind};

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(ApiError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_of(ReconcileError::RecordNotFound("ref".into()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(
                StoreError::NotFound {
                    kind: RecordKind::Payout,
                    record_id: RecordId::new(),
                }
                .into()
            ),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(
                ReconcileError::StoreConflict {
                    kind: RecordKind::Payout,
                    record_id: RecordId::new(),
                }
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(StoreError::Corrupt("bad row".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
