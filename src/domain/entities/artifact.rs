//! Build artifacts produced by the site builder.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

use crate::application::render::RenderDiagnostic;

/// One generated page document listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestPage {
    pub slug: String,
    pub file: String,
    pub page_id: i64,
    pub title: String,
    pub partial: bool,
    /// True when rendering failed and an error placeholder was written instead.
    pub placeholder: bool,
    pub diagnostics: usize,
}

/// Manifest written to `manifest.json` at the artifact root.
///
/// Contains no wall-clock timestamps so identical content produces an
/// identical manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub site_id: i64,
    pub site_name: String,
    pub domain: Option<String>,
    pub revision: DateTime<Utc>,
    pub pages: Vec<ManifestPage>,
    pub assets: Vec<String>,
}

/// Per-page outcome reported back to the caller of `generate`.
#[derive(Debug, Clone, Serialize)]
pub struct PageReport {
    pub slug: String,
    pub file: String,
    pub partial: bool,
    pub placeholder: bool,
    pub diagnostics: Vec<RenderDiagnostic>,
}

/// A generated site directory.
#[derive(Debug, Clone)]
pub struct BuildArtifact {
    pub site_id: i64,
    /// `{build_root}/site-{id}/{build_ts}`
    pub root: PathBuf,
    pub built_at: DateTime<Utc>,
    pub manifest: Manifest,
    pub reports: Vec<PageReport>,
}

impl BuildArtifact {
    /// Directory served by the site process.
    pub fn public_dir(&self) -> PathBuf {
        self.root.join(PUBLIC_DIR)
    }

    /// Number of page documents written.
    pub fn page_count(&self) -> usize {
        self.manifest.pages.len()
    }
}

/// Name of the served sub-directory inside an artifact.
pub const PUBLIC_DIR: &str = "public";
/// Manifest file name at the artifact root.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Stylesheet file name inside [`PUBLIC_DIR`].
pub const STYLESHEET_FILE: &str = "styles.css";
