//! Handler for single-page preview.

use axum::{
    extract::{Path, State},
    http::HeaderValue,
    response::{Html, IntoResponse, Response},
};

use crate::error::AppError;
use crate::state::AppState;

/// Number of render diagnostics, exposed so editors can flag broken sections.
pub const DIAGNOSTICS_HEADER: &str = "x-render-diagnostics";

/// Renders one published page exactly as a build would, with the stylesheet
/// embedded.
///
/// # Endpoint
///
/// `GET /api/sites/{id}/preview/{slug}`
///
/// # Errors
///
/// - **404 Not Found**: site or published page does not exist
pub async fn preview_handler(
    State(state): State<AppState>,
    Path((site_id, slug)): Path<(i64, String)>,
) -> Result<Response, AppError> {
    let page = state.pipeline.preview(site_id, &slug).await?;

    let mut response = Html(page.html).into_response();
    response.headers_mut().insert(
        DIAGNOSTICS_HEADER,
        HeaderValue::from(page.diagnostics.len()),
    );
    Ok(response)
}
