//! HTTP API server for payment and payout reconciliation.
//!
//! Exposes the sweep trigger, the on-demand payment status check and payout
//! reads, with structured logging (tracing) and Prometheus metrics.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use providers::ProviderRegistry;
use reconciliation::{
    NotificationDispatcher, NotificationGate, OnDemandStatus, ReconcileConfig,
    ReconciliationScheduler, Reconciler,
};
use record_store::{NotificationLog, RecordStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub reconciler: Arc<Reconciler>,
    pub scheduler: ReconciliationScheduler,
    pub on_demand: OnDemandStatus,
    /// Bearer token to user id.
    pub api_tokens: HashMap<String, String>,
    pub trigger_token: Option<String>,
}

/// Collaborators the engine is wired from.
pub struct Services {
    pub store: Arc<dyn RecordStore>,
    pub notification_log: Arc<dyn NotificationLog>,
    pub dispatcher: Arc<dyn NotificationDispatcher>,
    pub registry: ProviderRegistry,
}

impl AppState {
    /// Wires the reconciliation engine and its entry points.
    pub fn new(
        services: Services,
        reconcile: ReconcileConfig,
        api_tokens: HashMap<String, String>,
        trigger_token: Option<String>,
    ) -> Self {
        let gate = NotificationGate::new(services.notification_log, services.dispatcher);
        let reconciler = Arc::new(Reconciler::new(
            services.store.clone(),
            gate,
            services.registry,
            reconcile,
        ));

        Self {
            store: services.store,
            scheduler: ReconciliationScheduler::new(reconciler.clone()),
            on_demand: OnDemandStatus::new(reconciler.clone()),
            reconciler,
            api_tokens,
            trigger_token,
        }
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/reconciliation/run", get(routes::reconciliation::run))
        .route("/payments/status", post(routes::payments::status))
        .route("/payouts/{id}", get(routes::payouts::get))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
