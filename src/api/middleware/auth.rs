//! Bearer token authentication for the pipeline API.

use axum::{
    extract::{FromRequestParts, Request, State},
    middleware::Next,
    response::Response,
};
use axum_auth::AuthBearer;
use serde_json::json;

use crate::{error::AppError, state::AppState};

/// Identity of the token that authenticated a request.
///
/// Inserted into request extensions so handlers can attribute pipeline
/// runs to a caller.
#[derive(Debug, Clone)]
pub struct Caller {
    pub token_id: i64,
    pub name: String,
}

/// Rejects requests without an active API token.
///
/// ```text
/// Authorization: Bearer <token>
/// ```
///
/// The token is hashed with the server signing secret and looked up among
/// non-revoked tokens; `last_used_at` is refreshed on success. A missing
/// header, malformed scheme or unknown token all answer `401` with
/// `WWW-Authenticate: Bearer`.
///
/// Mount with `route_layer` so unmatched paths still return `404`:
///
/// ```rust,ignore
/// let api = protected_routes()
///     .route_layer(middleware::from_fn_with_state(state.clone(), auth::layer));
/// ```
pub async fn layer(
    State(st): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let (mut parts, body) = req.into_parts();

    let AuthBearer(token) = AuthBearer::from_request_parts(&mut parts, &())
        .await
        .map_err(|_| {
            AppError::unauthorized(
                "Unauthorized",
                json!({"reason": "Authorization header is missing or invalid"}),
            )
        })?;

    let stored = st.auth_service.authenticate(&token).await?;
    tracing::debug!(token = %stored.name, method = %parts.method, uri = %parts.uri, "Authenticated API request");

    parts.extensions.insert(Caller {
        token_id: stored.id,
        name: stored.name,
    });

    Ok(next.run(Request::from_parts(parts, body)).await)
}
