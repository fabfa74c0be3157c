//! DTOs for the deploy endpoints.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

use crate::application::services::{DeployRequest, is_valid_domain};
use crate::domain::remote::{HostAuth, HostConfig};

static USER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").unwrap());

/// Absolute path built from safe characters only; it ends up in shell commands.
static REMOTE_ROOT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[A-Za-z0-9._/-]*$").unwrap());

static ADDRESS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.:-]+$").unwrap());

/// Body of `POST /api/sites/{id}/deploy`.
#[derive(Debug, Deserialize, Validate)]
pub struct DeployBody {
    /// Public domain the site is served under.
    #[validate(custom(function = "validate_domain"))]
    pub domain: String,

    #[validate(nested)]
    pub host: HostBody,
}

/// Target host connection details.
#[derive(Debug, Deserialize, Validate)]
pub struct HostBody {
    #[validate(length(min = 1, max = 253), regex(path = "*ADDRESS_REGEX"))]
    pub address: String,

    #[serde(default = "default_ssh_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    #[validate(regex(path = "*USER_REGEX", message = "Invalid user name"))]
    pub user: String,

    #[validate(custom(function = "validate_auth"))]
    pub auth: AuthBody,

    #[validate(
        length(min = 2, max = 255),
        regex(path = "*REMOTE_ROOT_REGEX", message = "Must be an absolute path")
    )]
    pub remote_root: String,

    /// Base port of the blue/green pair; green listens on `app_port + 1`.
    #[validate(range(min = 1024, max = 65534))]
    pub app_port: u16,
}

/// How to authenticate against the host.
///
/// ```json
/// { "type": "key", "path": "/etc/pipeline/keys/id_ed25519" }
/// { "type": "password", "password": "..." }
/// { "type": "agent" }
/// ```
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthBody {
    Key { path: String },
    Password { password: String },
    Agent,
}

fn default_ssh_port() -> u16 {
    22
}

fn validate_domain(domain: &str) -> Result<(), ValidationError> {
    if is_valid_domain(domain) {
        Ok(())
    } else {
        Err(ValidationError::new("domain").with_message("Invalid domain name".into()))
    }
}

fn validate_auth(auth: &AuthBody) -> Result<(), ValidationError> {
    match auth {
        AuthBody::Key { path } if !path.starts_with('/') => Err(
            ValidationError::new("auth").with_message("Key path must be absolute".into()),
        ),
        AuthBody::Password { password } if password.is_empty() => Err(
            ValidationError::new("auth").with_message("Password must not be empty".into()),
        ),
        _ => Ok(()),
    }
}

impl From<DeployBody> for DeployRequest {
    fn from(body: DeployBody) -> Self {
        let host = body.host;
        DeployRequest {
            domain: body.domain.to_ascii_lowercase(),
            host: HostConfig {
                address: host.address,
                port: host.port,
                user: host.user,
                auth: match host.auth {
                    AuthBody::Key { path } => HostAuth::Key { path },
                    AuthBody::Password { password } => HostAuth::Password { password },
                    AuthBody::Agent => HostAuth::Agent,
                },
                remote_root: host.remote_root.trim_end_matches('/').to_string(),
                app_port: host.app_port,
            },
        }
    }
}

/// Query of `GET /api/sites/{id}/deployments`.
#[derive(Debug, Deserialize, Validate)]
pub struct HistoryParams {
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<i64>,
}

impl HistoryParams {
    pub const DEFAULT_LIMIT: i64 = 20;

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }
}
