//! Payout read endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::{RecordId, RecordKind};
use domain::Payout;
use uuid::Uuid;

use crate::AppState;
use crate::auth::Caller;
use crate::error::ApiError;

/// GET /payouts/{id}: returns one of the caller's payouts with its retry history.
#[tracing::instrument(skip(state, caller))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<Payout>, ApiError> {
    let uuid =
        Uuid::parse_str(&id).map_err(|e| ApiError::BadRequest(format!("Invalid payout id: {e}")))?;
    let id = RecordId::from_uuid(uuid);

    let payout = state
        .store
        .get(RecordKind::Payout, id)
        .await?
        .and_then(|record| record.as_payout().cloned())
        .filter(|payout| payout.driver_id == caller)
        .ok_or_else(|| ApiError::NotFound(format!("Payout {id} not found")))?;

    Ok(Json(payout))
}
