//! Handlers for deploying sites and inspecting the deployment ledger.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use serde_json::json;
use validator::Validate;

use crate::api::dto::deploy::{DeployBody, HistoryParams};
use crate::api::middleware::auth::Caller;
use crate::application::services::DeployRequest;
use crate::domain::entities::{DeploymentAttempt, DeploymentRecord};
use crate::error::AppError;
use crate::state::AppState;

/// Runs the full pipeline for a site and waits for the outcome.
///
/// # Endpoint
///
/// `POST /api/sites/{id}/deploy`
///
/// # Request Body
///
/// ```json
/// {
///   "domain": "harbour.example.com",
///   "host": {
///     "address": "203.0.113.10",
///     "port": 22,
///     "user": "deploy",
///     "auth": { "type": "key", "path": "/etc/pipeline/keys/id_ed25519" },
///     "remote_root": "/srv/sites",
///     "app_port": 4100
///   }
/// }
/// ```
///
/// # Response
///
/// The final deployment record with `state: "live"`.
///
/// The run continues in the background if the client disconnects; its
/// outcome is then available from the status endpoint.
///
/// # Errors
///
/// - **400 Bad Request**: invalid domain or host settings
/// - **404 Not Found**: site does not exist
/// - **409 Conflict**: a deploy is already in flight, or the run was cancelled
/// - **502 Bad Gateway**: a remote stage failed; `details.stage` names it and
///   `details.command_output` carries the failing command's output
/// - **500 Internal Server Error**: local build or packaging failed
pub async fn deploy_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(site_id): Path<i64>,
    Json(payload): Json<DeployBody>,
) -> Result<Json<DeploymentRecord>, AppError> {
    payload.validate()?;
    tracing::info!(site_id, caller = %caller.name, domain = %payload.domain, "Deploy requested");

    let pipeline = state.pipeline.clone();
    let request: DeployRequest = payload.into();
    let run = tokio::spawn(async move { pipeline.deploy(site_id, request).await });

    let record = run.await.map_err(|e| {
        tracing::error!(site_id, error = %e, "Deploy task panicked");
        AppError::internal("Deploy task failed", json!({}))
    })??;

    Ok(Json(record))
}

/// Returns the site's current deployment record.
///
/// # Endpoint
///
/// `GET /api/sites/{id}/status`
///
/// # Errors
///
/// - **404 Not Found**: the site was never deployed
pub async fn status_handler(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
) -> Result<Json<DeploymentRecord>, AppError> {
    match state.pipeline.status(site_id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(AppError::not_found(
            "No deployment recorded for site",
            json!({ "site_id": site_id }),
        )),
    }
}

/// Requests cancellation of the site's in-flight deploy.
///
/// # Endpoint
///
/// `POST /api/sites/{id}/deploy/cancel`
///
/// Cancellation takes effect at the next stage boundary or by interrupting
/// the running command. It is refused once traffic switching has begun.
///
/// # Errors
///
/// - **409 Conflict**: nothing is in flight, or routing is already being switched
pub async fn cancel_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(site_id): Path<i64>,
) -> Result<Json<DeploymentRecord>, AppError> {
    tracing::info!(site_id, caller = %caller.name, "Cancel requested");
    let record = state.pipeline.cancel(site_id).await?;
    Ok(Json(record))
}

/// Lists finished deploy attempts, newest first.
///
/// # Endpoint
///
/// `GET /api/sites/{id}/deployments?limit=20`
///
/// `limit` defaults to 20 and must be between 1 and 100.
pub async fn history_handler(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<DeploymentAttempt>>, AppError> {
    params.validate()?;
    let attempts = state.pipeline.history(site_id, params.limit()).await?;
    Ok(Json(attempts))
}
