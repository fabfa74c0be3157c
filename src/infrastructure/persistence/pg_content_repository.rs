//! PostgreSQL implementation of the content store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::sync::Arc;

use crate::domain::entities::{BlogPostSummary, MediaAsset, Page, Site};
use crate::domain::repositories::ContentRepository;
use crate::error::AppError;

/// Read-only view over the admin application's `sites`, `pages`, `media`
/// and `blog_posts` tables.
pub struct PgContentRepository {
    pool: Arc<PgPool>,
}

impl PgContentRepository {
    /// Creates a new repository with a database connection pool.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct SiteRow {
    id: i64,
    tenant_id: i64,
    name: String,
    domain: Option<String>,
    theme: Value,
    deploy_status: String,
    updated_at: DateTime<Utc>,
}

impl From<SiteRow> for Site {
    fn from(r: SiteRow) -> Self {
        Site::new(
            r.id,
            r.tenant_id,
            r.name,
            r.domain,
            r.theme,
            r.deploy_status,
            r.updated_at,
        )
    }
}

#[derive(FromRow)]
struct PageRow {
    id: i64,
    site_id: i64,
    slug: String,
    title: String,
    published: bool,
    menu_order: i32,
    content: Value,
    updated_at: DateTime<Utc>,
}

impl From<PageRow> for Page {
    fn from(r: PageRow) -> Self {
        Page::new(
            r.id,
            r.site_id,
            r.slug,
            r.title,
            r.published,
            r.menu_order,
            r.content,
            r.updated_at,
        )
    }
}

const PAGE_COLUMNS: &str =
    "id, site_id, slug, title, published, menu_order, content, updated_at";

#[derive(FromRow)]
struct MediaRow {
    id: i64,
    site_id: i64,
    storage_key: String,
    alt_text: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct PostRow {
    title: String,
    slug: String,
    excerpt: String,
    published_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl ContentRepository for PgContentRepository {
    async fn find_site(&self, site_id: i64) -> Result<Option<Site>, AppError> {
        let row = sqlx::query_as::<_, SiteRow>(
            r#"
            SELECT id, tenant_id, name, domain, theme, deploy_status, updated_at
            FROM sites
            WHERE id = $1
            "#,
        )
        .bind(site_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(Site::from))
    }

    async fn list_published_pages(&self, site_id: i64) -> Result<Vec<Page>, AppError> {
        let rows = sqlx::query_as::<_, PageRow>(&format!(
            "SELECT {PAGE_COLUMNS} FROM pages \
             WHERE site_id = $1 AND published \
             ORDER BY menu_order, id"
        ))
        .bind(site_id)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows.into_iter().map(Page::from).collect())
    }

    async fn find_published_page(
        &self,
        site_id: i64,
        slug: &str,
    ) -> Result<Option<Page>, AppError> {
        let row = sqlx::query_as::<_, PageRow>(&format!(
            "SELECT {PAGE_COLUMNS} FROM pages \
             WHERE site_id = $1 AND slug = $2 AND published"
        ))
        .bind(site_id)
        .bind(slug)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(Page::from))
    }

    async fn find_media(&self, site_id: i64, ids: &[i64]) -> Result<Vec<MediaAsset>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, MediaRow>(
            r#"
            SELECT id, site_id, storage_key, alt_text, created_at
            FROM media
            WHERE site_id = $1 AND id = ANY($2)
            "#,
        )
        .bind(site_id)
        .bind(ids)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| MediaAsset {
                id: r.id,
                site_id: r.site_id,
                storage_key: r.storage_key,
                alt_text: r.alt_text,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn recent_posts(
        &self,
        site_id: i64,
        limit: i64,
    ) -> Result<Vec<BlogPostSummary>, AppError> {
        let rows = sqlx::query_as::<_, PostRow>(
            r#"
            SELECT title, slug, excerpt, published_at
            FROM blog_posts
            WHERE site_id = $1
              AND published_at IS NOT NULL
              AND published_at <= NOW()
            ORDER BY published_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(site_id)
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| BlogPostSummary {
                title: r.title,
                slug: r.slug,
                excerpt: r.excerpt,
                published_at: r.published_at,
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }
}
