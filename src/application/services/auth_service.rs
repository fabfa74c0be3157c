//! Authentication service for API token validation.

use hmac::{Hmac, Mac};
use rand::Rng;
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;

use crate::domain::repositories::{ApiToken, TokenRepository};
use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_LEN: usize = 48;

/// Service for authenticating pipeline API requests via Bearer tokens.
///
/// Tokens are hashed with HMAC-SHA256 (keyed by `signing_secret`) before storage
/// and comparison. An attacker with read-only access to the database cannot verify
/// or forge tokens without the server-side secret.
pub struct AuthService {
    repository: Arc<dyn TokenRepository>,
    signing_secret: String,
}

impl AuthService {
    /// Creates a new authentication service.
    ///
    /// `signing_secret` must match the value used when tokens were created.
    pub fn new(repository: Arc<dyn TokenRepository>, signing_secret: String) -> Self {
        Self {
            repository,
            signing_secret,
        }
    }

    /// Hashes a raw token with HMAC-SHA256 using the server signing secret.
    ///
    /// Returns a 64-character lowercase hex-encoded MAC.
    pub fn hash_token(&self, token: &str) -> String {
        hash_with_secret(&self.signing_secret, token)
    }

    /// Authenticates a raw token against stored credentials.
    ///
    /// On success the token's `last_used_at` is refreshed; a failure to do so
    /// is logged and does not reject the request.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Unauthorized`] if the token is unknown or revoked.
    /// Returns [`AppError::Internal`] on database errors.
    pub async fn authenticate(&self, token: &str) -> Result<ApiToken, AppError> {
        let token_hash = self.hash_token(token);

        let Some(stored) = self.repository.find_active(&token_hash).await? else {
            return Err(AppError::unauthorized(
                "Unauthorized",
                json!({"reason": "Invalid or revoked token"}),
            ));
        };

        if let Err(e) = self.repository.touch(stored.id).await {
            tracing::warn!(token_id = stored.id, error = %e, "Failed to update token last_used_at");
        }

        Ok(stored)
    }

    /// Stores a new token under `name` and returns it with its raw value.
    ///
    /// The raw value is generated when `raw` is `None`. It is never stored and
    /// cannot be recovered later.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Conflict`] if the name or value is already in use.
    pub async fn issue(&self, name: &str, raw: Option<String>) -> Result<(ApiToken, String), AppError> {
        let raw = raw.unwrap_or_else(generate_token);
        let token = self
            .repository
            .create_token(name, &self.hash_token(&raw))
            .await?;
        Ok((token, raw))
    }

    /// All tokens, newest first, including revoked ones.
    pub async fn list(&self) -> Result<Vec<ApiToken>, AppError> {
        self.repository.list_tokens().await
    }

    /// Looks a token up by numeric id, falling back to its name.
    pub async fn find(&self, id_or_name: &str) -> Result<Option<ApiToken>, AppError> {
        self.repository.find_by_id_or_name(id_or_name).await
    }

    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if the token is unknown or already revoked.
    pub async fn revoke(&self, id: i64) -> Result<(), AppError> {
        self.repository.revoke_token(id).await?;
        tracing::info!(token_id = id, "API token revoked");
        Ok(())
    }
}

fn hash_with_secret(secret: &str, token: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Generates a random alphanumeric token.
pub fn generate_token() -> String {
    let mut rng = rand::rng();
    (0..TOKEN_LEN)
        .map(|_| TOKEN_CHARSET[rng.random_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}
