mod config;
mod db;
mod error;
mod middleware;
mod openapi;
mod quota;
mod routes;
mod scheduler;

use axum::{error_handling::HandleErrorLayer, http::StatusCode, BoxError};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::{sync::Arc, time::Duration};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::db::{
    create_pool, run_migrations, DbConfig, SelectionRepository, SqliteQuotaStore,
    SqliteSelectionRepository, SqliteUserDirectory,
};
use crate::quota::{FixedWindowPolicy, QuotaService, ServiceOptions};
use crate::scheduler::{QuotaScheduler, Trigger};

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub quota_service: Arc<QuotaService>,
    pub selections: Arc<dyn SelectionRepository>,
    pub scheduler: Arc<QuotaScheduler>,
    pub metrics: Option<PrometheusHandle>,
    pub config: Arc<AppConfig>,
}

/// Handle request timeout errors
async fn handle_timeout_error(err: BoxError) -> (StatusCode, String) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::REQUEST_TIMEOUT, "Request timed out".to_string())
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal error: {}", err),
        )
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "daily_quota=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = AppConfig::load()?;
    tracing::info!(
        capacity = config.quota.capacity,
        interval_secs = config.quota.interval_secs,
        "Configuration loaded successfully"
    );

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics recorder not installed");
            None
        }
    };

    // Database
    let pool = create_pool(&DbConfig {
        url: config.database_url.clone(),
        max_connections: config.max_connections,
    })
    .await?;
    run_migrations(&pool).await?;

    // Quota core: store + user lookup + policy
    let policy = Arc::new(FixedWindowPolicy::new(
        config.quota.capacity,
        config.quota_interval(),
    ));
    let quota_service = Arc::new(QuotaService::new(
        Arc::new(SqliteQuotaStore::new(pool.clone())),
        Arc::new(SqliteUserDirectory::new(pool.clone())),
        policy,
        ServiceOptions {
            max_conflict_retries: config.quota.max_conflict_retries,
            scan_page_size: config.quota.scan_page_size,
        },
    ));

    // Reset scheduler
    let trigger = Trigger::from_config(&config.scheduler)?;
    let scheduler = Arc::new(QuotaScheduler::new(Arc::clone(&quota_service), trigger).await?);
    if config.scheduler.enabled {
        scheduler.start().await?;
    } else {
        tracing::info!("Quota reset scheduler disabled");
    }

    let state = AppState {
        quota_service,
        selections: Arc::new(SqliteSelectionRepository::new(pool.clone())),
        scheduler: Arc::clone(&scheduler),
        metrics,
        config: Arc::new(config.clone()),
    };

    let app = routes::build_router(&state)
        .layer(
            ServiceBuilder::new()
                // Handle timeout errors
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server with graceful shutdown
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if config.scheduler.enabled {
        if let Err(e) = scheduler.stop().await {
            tracing::warn!(error = %e, "Scheduler did not stop cleanly");
        }
    }
    pool.close().await;

    tracing::info!("Server shutdown complete");

    Ok(())
}
