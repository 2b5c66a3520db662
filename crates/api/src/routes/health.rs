//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use common::ProviderId;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Providers with a registered adapter.
    pub providers: Vec<ProviderId>,
}

/// GET /health: returns process health and the configured providers.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        providers: state.reconciler.registry().providers(),
    })
}
