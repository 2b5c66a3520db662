//! Sweep trigger endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use reconciliation::SweepReport;

use crate::AppState;
use crate::auth::authorize_trigger;
use crate::error::ApiError;

/// GET /reconciliation/run: runs one sweep and returns the per-record report.
///
/// Per-record failures are part of the report. Only a store outage fails the
/// request.
#[tracing::instrument(skip_all)]
pub async fn run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SweepReport>, ApiError> {
    authorize_trigger(&state, &headers)?;

    let report = state.scheduler.run_sweep().await.map_err(|e| {
        tracing::error!(error = %e, "reconciliation sweep aborted");
        ApiError::Internal(format!("reconciliation sweep failed: {e}"))
    })?;
    Ok(Json(report))
}
