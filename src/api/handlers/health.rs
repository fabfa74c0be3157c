//! Handler for health check endpoint.

use axum::{Json, extract::State, http::StatusCode};

use crate::api::dto::health::{CheckStatus, HealthChecks, HealthResponse, Overall};
use crate::state::AppState;

/// Returns service health status with component checks.
///
/// # Endpoint
///
/// `GET /health`
///
/// # Response Codes
///
/// - **200 OK**: All components healthy
/// - **503 Service Unavailable**: One or more components degraded
///
/// # Components Checked
///
/// 1. **Database**: `SELECT 1` against the content store
/// 2. **Build root**: the build directory accepts writes
///
/// # Response
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "checks": {
///     "database": { "status": "ok", "message": "Connected" },
///     "build_root": { "status": "ok", "message": "Writable" }
///   }
/// }
/// ```
pub async fn health_handler(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<HealthResponse>)> {
    let report = state.pipeline.health().await;
    let all_healthy = report.is_healthy();

    let response = HealthResponse {
        status: if all_healthy {
            Overall::Healthy
        } else {
            Overall::Degraded
        },
        version: env!("CARGO_PKG_VERSION"),
        checks: HealthChecks {
            database: CheckStatus::from_probe(&report.database, "Connected"),
            build_root: CheckStatus::from_probe(&report.build_root, "Writable"),
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(response)))
    }
}
