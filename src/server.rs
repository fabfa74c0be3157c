//! HTTP server initialization and runtime setup.
//!
//! Handles the database pool, migrations, service wiring and the Axum server
//! lifecycle.

use crate::application::services::{
    AuthService, ContentResolver, DeploymentLedger, Packager, PipelineService, RemoteDeployer,
    SiteBuilder,
};
use crate::config::Config;
use crate::infrastructure::media::MediaStorage;
use crate::infrastructure::persistence::{
    PgContentRepository, PgDeploymentRepository, PgTokenRepository,
};
use crate::infrastructure::ssh::OpenSshConnector;
use crate::routes::app_router;
use crate::state::AppState;

use anyhow::{Context, Result};
use axum::ServiceExt;
use axum::extract::Request;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Opens the connection pool with the configured limits.
///
/// # Errors
///
/// Returns an error if the database is unreachable.
pub async fn connect_pool(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(config.db_connect_timeout))
        .idle_timeout(Duration::from_secs(config.db_idle_timeout))
        .max_lifetime(Duration::from_secs(config.db_max_lifetime))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Connected to database");
    Ok(pool)
}

/// Wires repositories and services into an [`AppState`].
///
/// Shared by the HTTP server and the admin CLI so both drive the same
/// pipeline.
pub fn build_state(config: &Config, pool: PgPool) -> AppState {
    let pool = Arc::new(pool);
    let content = Arc::new(PgContentRepository::new(pool.clone()));
    let deployments = Arc::new(PgDeploymentRepository::new(pool.clone()));
    let tokens = Arc::new(PgTokenRepository::new(pool));

    let media = Arc::new(MediaStorage::new(
        config.media_base(),
        config.media_fallback_prefix.clone(),
        Duration::from_millis(config.media_probe_timeout_ms),
    ));

    let resolver = Arc::new(ContentResolver::new(content.clone(), media));
    let builder = Arc::new(SiteBuilder::new(&config.build_root));
    let packager = Arc::new(Packager::new(&config.bundle_root, config.descriptor.clone()));
    let connector = Arc::new(OpenSshConnector::new(
        Duration::from_secs(config.ssh_connect_timeout),
        &config.ssh_control_dir,
    ));
    let deployer = Arc::new(RemoteDeployer::new(connector, config.deployer_settings()));
    let ledger = Arc::new(DeploymentLedger::new(
        deployments,
        chrono::Duration::seconds(config.deploy_stale_after as i64),
    ));

    let pipeline = Arc::new(PipelineService::new(
        content, resolver, builder, packager, deployer, ledger,
    ));
    let auth_service = Arc::new(AuthService::new(
        tokens,
        config.token_signing_secret.clone(),
    ));

    AppState::new(pipeline, auth_service)
}

/// Runs the HTTP server with the given configuration.
///
/// Initializes:
/// - PostgreSQL connection pool
/// - Apply migrations
/// - Local build, bundle and ssh control directories
/// - Axum HTTP server
///
/// # Errors
///
/// Returns an error if:
/// - Database connection or migration fails
/// - A local output directory cannot be created
/// - Server bind fails
/// - Server runtime error occurs
pub async fn run(config: Config) -> Result<()> {
    let pool = connect_pool(&config).await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to migrate")?;

    for dir in [&config.build_root, &config.bundle_root, &config.ssh_control_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let state = build_state(&config, pool);
    let app = app_router(state, config.behind_proxy);

    let addr: SocketAddr = config.listen_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{addr}");

    axum::serve(
        listener,
        ServiceExt::<Request>::into_make_service_with_connect_info::<SocketAddr>(app),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
