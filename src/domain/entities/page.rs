//! Page entity as stored in the content database.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A page belonging to one site.
///
/// `content` is the raw section list exactly as the admin UI stored it. It is
/// parsed leniently by the content resolver; nothing here assumes it is valid.
#[derive(Debug, Clone)]
pub struct Page {
    pub id: i64,
    pub site_id: i64,
    pub slug: String,
    pub title: String,
    pub published: bool,
    pub menu_order: i32,
    pub content: Value,
    pub updated_at: DateTime<Utc>,
}

impl Page {
    /// Creates a new Page instance.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i64,
        site_id: i64,
        slug: String,
        title: String,
        published: bool,
        menu_order: i32,
        content: Value,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            site_id,
            slug,
            title,
            published,
            menu_order,
            content,
            updated_at,
        }
    }

    /// Returns true if this page is served at the site root.
    pub fn is_home(&self) -> bool {
        is_home_slug(&self.slug)
    }
}

/// Slugs that map to the site root document.
pub fn is_home_slug(slug: &str) -> bool {
    matches!(slug, "home" | "index")
}
