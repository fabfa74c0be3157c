//! Deploy bundles and their embedded descriptor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Instructions for the target host, embedded as `deploy.json` in every bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployDescriptor {
    pub runtime_version: String,
    pub install_command: String,
    pub build_command: String,
    pub start_command: String,
    pub built_at: DateTime<Utc>,
}

/// A packaged artifact ready for transfer.
///
/// The file name is the hex sha256 of its content, so identical artifacts map
/// to the same bundle.
#[derive(Debug, Clone)]
pub struct DeployBundle {
    pub site_id: i64,
    pub path: PathBuf,
    pub digest: String,
    pub size: u64,
    pub descriptor: DeployDescriptor,
}

impl DeployBundle {
    /// Short digest prefix used for remote release directory names.
    pub fn release_name(&self) -> &str {
        &self.digest[..self.digest.len().min(16)]
    }
}

/// File name of the descriptor inside the bundle.
pub const DESCRIPTOR_FILE: &str = "deploy.json";
