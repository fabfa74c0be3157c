//! The resolved, render-ready snapshot of a site.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::section::Section;
use super::site::{Site, SiteTheme};

/// A published page with its sections parsed and media attached.
#[derive(Debug, Clone)]
pub struct ResolvedPage {
    pub id: i64,
    pub slug: String,
    pub title: String,
    pub menu_order: i32,
    pub sections: Vec<Section>,
    /// True when the stored section list could not be parsed and was replaced
    /// by a single fallback section.
    pub partial: bool,
}

/// A page whose content was degraded during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedPage {
    pub page_id: i64,
    pub slug: String,
    pub reason: String,
}

/// Immutable aggregate handed to the site builder and the preview path.
///
/// One model exists per build invocation; it is never cached or shared
/// between requests.
#[derive(Debug, Clone)]
pub struct SiteModel {
    pub site: Site,
    pub theme: SiteTheme,
    pub pages: Vec<ResolvedPage>,
    pub degraded: Vec<DegradedPage>,
    /// Theme tokens that were rejected and replaced with defaults.
    pub rejected_theme_tokens: Vec<String>,
    /// Media ids served from the local fallback path instead of object storage.
    pub media_fallbacks: Vec<i64>,
    /// Latest content change across the site and its pages. Used as the
    /// deploy descriptor's `builtAt` so unchanged content packages identically.
    pub revision: DateTime<Utc>,
}

impl SiteModel {
    /// True when the site has no published pages. The model is still valid
    /// and builds into an artifact with zero page documents.
    pub fn has_no_published_pages(&self) -> bool {
        self.pages.is_empty()
    }
}
