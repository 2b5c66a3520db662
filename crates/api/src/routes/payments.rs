//! On-demand payment status endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use common::{ProviderId, RecordId};
use domain::CanonicalStatus;
use reconciliation::{StatusRequest, StatusView};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::auth::Caller;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusRequest {
    pub transaction_reference: String,
    pub provider: String,
    #[serde(default)]
    pub booking_reference: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusData {
    pub status: CanonicalStatus,
    pub message: String,
    pub transaction_id: RecordId,
    pub stale: bool,
}

#[derive(Debug, Serialize)]
pub struct PaymentStatusResponse {
    pub success: bool,
    pub data: PaymentStatusData,
}

impl From<StatusView> for PaymentStatusResponse {
    fn from(view: StatusView) -> Self {
        Self {
            success: true,
            data: PaymentStatusData {
                status: view.status,
                message: view.message,
                transaction_id: view.transaction_id,
                stale: view.stale,
            },
        }
    }
}

/// POST /payments/status: reconciles one payment and returns its status.
///
/// A body that is not valid JSON or lacks a field is answered with 400.
#[tracing::instrument(skip_all, fields(provider = tracing::field::Empty))]
pub async fn status(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    body: Result<Json<PaymentStatusRequest>, JsonRejection>,
) -> Result<Json<PaymentStatusResponse>, ApiError> {
    let Json(req) = body?;
    tracing::Span::current().record("provider", req.provider.as_str());
    let provider: ProviderId = req
        .provider
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    let reference = req.transaction_reference.trim();
    if reference.is_empty() {
        return Err(ApiError::BadRequest(
            "transactionReference is required".to_string(),
        ));
    }

    let request = StatusRequest {
        provider,
        reference: reference.to_string(),
        booking_reference: req
            .booking_reference
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty()),
        caller,
    };
    let view = state.on_demand.check(&request).await?;
    metrics::counter!(
        "on_demand_status_checks_total",
        "stale" => if view.stale { "true" } else { "false" }
    )
    .increment(1);
    Ok(Json(view.into()))
}
