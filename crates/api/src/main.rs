//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use api::{AppState, Services};
use providers::{AirtelMoneyAdapter, MtnMomoAdapter, ProviderRegistry};
use reconciliation::TracingNotificationDispatcher;
use record_store::{
    InMemoryNotificationLog, InMemoryRecordStore, PostgresNotificationLog, PostgresRecordStore,
};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Registers an adapter for every provider with credentials.
fn provider_registry(config: &Config) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    if let Some(mtn) = &config.mtn {
        match MtnMomoAdapter::new(mtn.clone()) {
            Ok(adapter) => registry.register(Arc::new(adapter)),
            Err(e) => tracing::error!(error = %e, "failed to build MTN MoMo adapter"),
        }
    }
    if let Some(airtel) = &config.airtel {
        match AirtelMoneyAdapter::new(airtel.clone()) {
            Ok(adapter) => registry.register(Arc::new(adapter)),
            Err(e) => tracing::error!(error = %e, "failed to build Airtel Money adapter"),
        }
    }
    if registry.is_empty() {
        tracing::warn!("no provider credentials configured, records will be skipped");
    }
    registry
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Select the record store
    let registry = provider_registry(&config);
    let dispatcher = Arc::new(TracingNotificationDispatcher);
    let services = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = PostgresRecordStore::new(pool.clone());
            store.run_migrations().await.expect("migrations failed");
            tracing::info!("using PostgreSQL record store");
            Services {
                store: Arc::new(store),
                notification_log: Arc::new(PostgresNotificationLog::new(pool)),
                dispatcher,
                registry,
            }
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory record store");
            Services {
                store: Arc::new(InMemoryRecordStore::new()),
                notification_log: Arc::new(InMemoryNotificationLog::new()),
                dispatcher,
                registry,
            }
        }
    };

    // 4. Build the application
    let state = Arc::new(AppState::new(
        services,
        config.reconcile.clone(),
        config.api_tokens.clone(),
        config.trigger_token.clone(),
    ));
    let app = api::create_app(state, metrics_handle);

    // 5. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("server shut down gracefully");
}
