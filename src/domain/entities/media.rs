//! Media references into external object storage.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A media row from the content store.
#[derive(Debug, Clone)]
pub struct MediaAsset {
    pub id: i64,
    pub site_id: i64,
    pub storage_key: String,
    pub alt_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A resolved pointer to a media object.
///
/// The pipeline only ever carries URLs. When object storage could not be
/// reached, `fallback` is set and `url` points at the local media prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaReference {
    pub id: Option<i64>,
    pub url: String,
    pub alt: Option<String>,
    pub fallback: bool,
}

impl MediaReference {
    /// A reference to an image hosted outside our object storage.
    pub fn external(url: String, alt: Option<String>) -> Self {
        Self {
            id: None,
            url,
            alt,
            fallback: false,
        }
    }
}

/// A published blog post summarised for blog-excerpt sections.
#[derive(Debug, Clone, PartialEq)]
pub struct BlogPostSummary {
    pub title: String,
    pub slug: String,
    pub excerpt: String,
    pub published_at: Option<DateTime<Utc>>,
}
