//! Read-only access to the tenant content store.

use crate::domain::entities::{BlogPostSummary, MediaAsset, Page, Site};
use crate::error::AppError;
use async_trait::async_trait;

/// Repository interface over the content database owned by the admin
/// application. The pipeline never writes through it.
///
/// # Implementations
///
/// - [`crate::infrastructure::persistence::PgContentRepository`] - PostgreSQL implementation
/// - Test mocks available with `cfg(test)`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentRepository: Send + Sync {
    /// Finds a site by id.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Internal`] on database errors.
    async fn find_site(&self, site_id: i64) -> Result<Option<Site>, AppError>;

    /// Lists a site's published pages ordered by menu order, then id.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Internal`] on database errors.
    async fn list_published_pages(&self, site_id: i64) -> Result<Vec<Page>, AppError>;

    /// Finds exactly one published page by slug.
    ///
    /// Used by the preview path, which must not touch other pages.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Internal`] on database errors.
    async fn find_published_page(&self, site_id: i64, slug: &str)
    -> Result<Option<Page>, AppError>;

    /// Loads the media rows with the given ids that belong to the site.
    ///
    /// Ids that do not exist, or belong to another site, are simply absent
    /// from the result.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Internal`] on database errors.
    async fn find_media(&self, site_id: i64, ids: &[i64]) -> Result<Vec<MediaAsset>, AppError>;

    /// Most recent published blog posts, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Internal`] on database errors.
    async fn recent_posts(
        &self,
        site_id: i64,
        limit: i64,
    ) -> Result<Vec<BlogPostSummary>, AppError>;

    /// Checks connectivity for health reporting.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Internal`] when the store is unreachable.
    async fn ping(&self) -> Result<(), AppError>;
}
