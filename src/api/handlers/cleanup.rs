//! Handler for removing local build output.

use axum::{
    Json,
    extract::{Path, State},
};

use crate::application::services::CleanupReport;
use crate::error::AppError;
use crate::state::AppState;

/// Removes every local build and bundle of a site.
///
/// # Endpoint
///
/// `DELETE /api/sites/{id}/artifact`
///
/// # Response
///
/// ```json
/// { "site_id": 3, "builds_removed": true, "bundles_removed": false }
/// ```
///
/// # Errors
///
/// - **409 Conflict**: a deploy for the site is in flight
pub async fn cleanup_handler(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
) -> Result<Json<CleanupReport>, AppError> {
    let report = state.pipeline.cleanup(site_id).await?;
    Ok(Json(report))
}
