//! Handler for local site generation.

use axum::{
    Json,
    extract::{Path, State},
};

use crate::application::services::GenerateReport;
use crate::error::AppError;
use crate::state::AppState;

/// Builds a site locally without deploying it.
///
/// # Endpoint
///
/// `POST /api/sites/{id}/generate`
///
/// # Response
///
/// ```json
/// {
///   "site_id": 3,
///   "artifact_path": "/var/lib/pipeline/builds/site-3/1718000000000",
///   "built_at": "2024-06-10T08:00:00Z",
///   "page_count": 2,
///   "no_published_pages": false,
///   "pages": [
///     { "slug": "home", "file": "public/index.html", "partial": false,
///       "placeholder": false, "diagnostics": [] }
///   ],
///   "degraded": [],
///   "media_fallbacks": [],
///   "rejected_theme_tokens": []
/// }
/// ```
///
/// A site without published pages still builds; `no_published_pages` is set.
///
/// # Errors
///
/// - **404 Not Found**: site does not exist
/// - **500 Internal Server Error**: content store or filesystem failure
pub async fn generate_handler(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
) -> Result<Json<GenerateReport>, AppError> {
    let report = state.pipeline.generate(site_id).await?;
    Ok(Json(report))
}
