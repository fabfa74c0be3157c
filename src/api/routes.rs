//! API route configuration.
//!
//! All API endpoints require Bearer token authentication via
//! [`crate::api::middleware::auth`].

use crate::api::handlers::{
    cancel_handler, cleanup_handler, deploy_handler, generate_handler, history_handler,
    preview_handler, status_handler,
};
use crate::state::AppState;
use axum::{
    Router,
    routing::{delete, get, post},
};

/// All API routes, protected by Bearer token authentication.
///
/// # Endpoints
///
/// - `POST   /sites/{id}/generate`        - Build the site locally
/// - `POST   /sites/{id}/deploy`          - Build, package and deploy to a host
/// - `POST   /sites/{id}/deploy/cancel`   - Cancel the in-flight deploy
/// - `GET    /sites/{id}/status`          - Current deployment record
/// - `GET    /sites/{id}/deployments`     - Finished attempts, newest first
/// - `GET    /sites/{id}/preview/{slug}`  - Render one page as HTML
/// - `DELETE /sites/{id}/artifact`        - Remove local builds and bundles
pub fn protected_routes() -> Router<AppState> {
    Router::new()
        .route("/sites/{id}/generate", post(generate_handler))
        .route("/sites/{id}/deploy", post(deploy_handler))
        .route("/sites/{id}/deploy/cancel", post(cancel_handler))
        .route("/sites/{id}/status", get(status_handler))
        .route("/sites/{id}/deployments", get(history_handler))
        .route("/sites/{id}/preview/{slug}", get(preview_handler))
        .route("/sites/{id}/artifact", delete(cleanup_handler))
}
