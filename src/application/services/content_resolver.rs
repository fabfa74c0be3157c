//! Content Resolver: builds the immutable [`SiteModel`] for one request.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::application::render::BLOG_LIMIT;
use crate::domain::entities::section::{BlogExcerpt, parse_section_list};
use crate::domain::entities::{
    BlogPostSummary, DegradedPage, MediaReference, Page, ResolvedPage, Section, Site, SiteModel,
    SiteTheme,
};
use crate::domain::errors::ResolveError;
use crate::domain::repositories::ContentRepository;
use crate::error::AppError;
use crate::infrastructure::media::MediaStorage;

const DEFAULT_BLOG_POSTS: i64 = 3;

/// Reads sites, pages and media from the content store and assembles them
/// into a render-ready model.
///
/// Content problems never fail a resolve. Unparseable section lists mark the
/// page `partial`, unresolved media is left for the renderer to report.
pub struct ContentResolver {
    repository: Arc<dyn ContentRepository>,
    media: Arc<MediaStorage>,
}

impl ContentResolver {
    pub fn new(repository: Arc<dyn ContentRepository>, media: Arc<MediaStorage>) -> Self {
        Self { repository, media }
    }

    /// Resolves a site with all of its published pages.
    ///
    /// A site with no published pages resolves to a valid, empty model.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::NotFound`] if the site does not exist
    /// - [`ResolveError::Store`] if the content store fails
    pub async fn resolve(&self, site_id: i64) -> Result<SiteModel, ResolveError> {
        let site = self.find_site(site_id).await?;
        let pages = self
            .repository
            .list_published_pages(site_id)
            .await
            .map_err(store_error)?;

        if pages.is_empty() {
            tracing::info!(site_id, "Site has no published pages");
        }

        self.assemble(site, pages).await
    }

    /// Resolves a site with exactly one published page, for preview.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::NotFound`] if the site does not exist
    /// - [`ResolveError::PageNotFound`] if no published page has this slug
    /// - [`ResolveError::Store`] if the content store fails
    pub async fn resolve_page(&self, site_id: i64, slug: &str) -> Result<SiteModel, ResolveError> {
        let site = self.find_site(site_id).await?;
        let page = self
            .repository
            .find_published_page(site_id, slug)
            .await
            .map_err(store_error)?
            .ok_or_else(|| ResolveError::PageNotFound {
                site_id,
                slug: slug.to_string(),
            })?;

        self.assemble(site, vec![page]).await
    }

    async fn find_site(&self, site_id: i64) -> Result<Site, ResolveError> {
        self.repository
            .find_site(site_id)
            .await
            .map_err(store_error)?
            .ok_or(ResolveError::NotFound(site_id))
    }

    async fn assemble(&self, site: Site, pages: Vec<Page>) -> Result<SiteModel, ResolveError> {
        let (theme, rejected_theme_tokens) = SiteTheme::from_tokens(&site.theme);
        if !rejected_theme_tokens.is_empty() {
            tracing::warn!(
                site_id = site.id,
                tokens = ?rejected_theme_tokens,
                "Rejected invalid theme tokens"
            );
        }

        let revision = pages
            .iter()
            .map(|p| p.updated_at)
            .fold(site.updated_at, |latest, t| latest.max(t));

        let mut degraded = Vec::new();
        let mut resolved: Vec<ResolvedPage> = pages
            .into_iter()
            .map(|page| parse_page(page, &mut degraded))
            .collect();
        resolved.sort_by_key(|p| (p.menu_order, p.id));

        let media_fallbacks = self.attach_media(site.id, &mut resolved).await?;
        self.fill_blog_sections(site.id, &mut resolved).await?;

        Ok(SiteModel {
            site,
            theme,
            pages: resolved,
            degraded,
            rejected_theme_tokens,
            media_fallbacks,
            revision,
        })
    }

    /// Resolves every media id on every page with one batched query.
    ///
    /// Returns the ids that were served from the fallback prefix.
    async fn attach_media(
        &self,
        site_id: i64,
        pages: &mut [ResolvedPage],
    ) -> Result<Vec<i64>, ResolveError> {
        let ids: BTreeSet<i64> = pages
            .iter()
            .flat_map(|p| p.sections.iter())
            .flat_map(Section::media_ids)
            .collect();

        let mut by_id: HashMap<i64, MediaReference> = HashMap::new();
        let mut fallbacks = Vec::new();

        if !ids.is_empty() {
            let ids: Vec<i64> = ids.into_iter().collect();
            let assets = self
                .repository
                .find_media(site_id, &ids)
                .await
                .map_err(store_error)?;

            let base = self.media.probe().await;
            for asset in assets {
                if base.is_fallback() {
                    fallbacks.push(asset.id);
                }
                by_id.insert(
                    asset.id,
                    MediaReference {
                        id: Some(asset.id),
                        url: base.url_for(&asset.storage_key),
                        alt: asset.alt_text,
                        fallback: base.is_fallback(),
                    },
                );
            }

            let missing: Vec<i64> = ids.iter().filter(|id| !by_id.contains_key(id)).copied().collect();
            if !missing.is_empty() {
                tracing::warn!(site_id, missing = ?missing, "Referenced media not found");
            }
            if !fallbacks.is_empty() {
                tracing::warn!(
                    site_id,
                    count = fallbacks.len(),
                    "Media resolved against fallback prefix"
                );
            }
        }

        for section in pages.iter_mut().flat_map(|p| p.sections.iter_mut()) {
            section.attach_media(|slot| match (slot.id, &slot.url) {
                (Some(id), _) => by_id.get(&id).cloned(),
                (None, Some(url)) => Some(MediaReference::external(url.clone(), slot.alt.clone())),
                (None, None) => None,
            });
        }

        Ok(fallbacks)
    }

    /// Fills blog sections that carry no inline posts with the site's most
    /// recent published posts.
    async fn fill_blog_sections(
        &self,
        site_id: i64,
        pages: &mut [ResolvedPage],
    ) -> Result<(), ResolveError> {
        let needs_posts = pages
            .iter()
            .flat_map(|p| p.sections.iter())
            .any(|s| matches!(s, Section::Blog(data) if data.posts.is_empty()));
        if !needs_posts {
            return Ok(());
        }

        let (_, max) = BLOG_LIMIT;
        let posts = self
            .repository
            .recent_posts(site_id, max)
            .await
            .map_err(store_error)?;

        for section in pages.iter_mut().flat_map(|p| p.sections.iter_mut()) {
            if let Section::Blog(data) = section
                && data.posts.is_empty()
            {
                let (min, max) = BLOG_LIMIT;
                let take = data.limit.unwrap_or(DEFAULT_BLOG_POSTS).clamp(min, max) as usize;
                data.posts = posts.iter().take(take).map(excerpt).collect();
            }
        }
        Ok(())
    }
}

fn parse_page(page: Page, degraded: &mut Vec<DegradedPage>) -> ResolvedPage {
    let (sections, partial) = match parse_section_list(&page.content) {
        Ok(sections) => (sections, false),
        Err(reason) => {
            tracing::warn!(page_id = page.id, slug = %page.slug, %reason, "Page content degraded");
            degraded.push(DegradedPage {
                page_id: page.id,
                slug: page.slug.clone(),
                reason: reason.clone(),
            });
            (
                vec![Section::Malformed {
                    kind: "page".to_string(),
                    reason,
                }],
                true,
            )
        }
    };

    ResolvedPage {
        id: page.id,
        slug: page.slug,
        title: page.title,
        menu_order: page.menu_order,
        sections,
        partial,
    }
}

fn excerpt(post: &BlogPostSummary) -> BlogExcerpt {
    BlogExcerpt {
        title: post.title.clone(),
        excerpt: post.excerpt.clone(),
        url: None,
        published_at: post.published_at,
    }
}

fn store_error(e: AppError) -> ResolveError {
    ResolveError::Store(e.to_string())
}
