//! Response of `GET /health`.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Overall {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Error,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: Overall,
    pub version: &'static str,
    pub checks: HealthChecks,
}

/// One entry per dependency the pipeline cannot run without.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Content store reachable.
    pub database: CheckStatus,
    /// Local build directory writable.
    pub build_root: CheckStatus,
}

#[derive(Debug, Serialize)]
pub struct CheckStatus {
    pub status: ProbeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckStatus {
    /// Maps a probe result; failures carry their reason.
    pub fn from_probe(probe: &Result<(), String>, ok_message: &str) -> Self {
        match probe {
            Ok(()) => Self {
                status: ProbeStatus::Ok,
                message: Some(ok_message.to_string()),
            },
            Err(reason) => Self {
                status: ProbeStatus::Error,
                message: Some(reason.clone()),
            },
        }
    }
}
