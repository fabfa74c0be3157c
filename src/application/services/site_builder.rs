//! Site Builder: writes a self-contained site directory from a [`SiteModel`].

use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::application::render::{
    NavItem, PageContext, RenderDiagnostic, RenderedPage, Stylesheet, render_error_page,
    render_page, stylesheet,
};
use crate::domain::entities::artifact::{MANIFEST_FILE, PUBLIC_DIR, STYLESHEET_FILE};
use crate::domain::entities::page::is_home_slug;
use crate::domain::entities::site::site_key;
use crate::domain::entities::{
    BuildArtifact, Manifest, ManifestPage, PageReport, ResolvedPage, SiteModel,
};
use crate::domain::errors::BuildError;

const PACKAGE_FILE: &str = "package.json";
const MAX_SLUG_LEN: usize = 80;

type PageRenderer = fn(&ResolvedPage, PageContext<'_>) -> Result<RenderedPage, askama::Error>;

/// One document queued for writing.
struct Document {
    relative: String,
    html: String,
}

/// Renders a site model into `{build_root}/site-{id}/{build_ts_ms}/`.
pub struct SiteBuilder {
    build_root: PathBuf,
    renderer: PageRenderer,
}

impl SiteBuilder {
    pub fn new(build_root: impl Into<PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
            renderer: render_page,
        }
    }

    #[cfg(test)]
    fn with_renderer(mut self, renderer: PageRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    /// Directory holding every build of one site.
    pub fn site_dir(&self, site_id: i64) -> PathBuf {
        self.build_root.join(site_key(site_id))
    }

    /// Builds the site and removes older builds of it.
    ///
    /// Pages that fail to render are replaced by an error placeholder and the
    /// build continues.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Io`] if the artifact cannot be written. A partly
    /// written artifact is removed.
    #[tracing::instrument(skip(self, model), fields(site_id = model.site.id))]
    pub async fn build(&self, model: &SiteModel) -> Result<BuildArtifact, BuildError> {
        let site_id = model.site.id;
        let site_dir = self.site_dir(site_id);
        fs::create_dir_all(&site_dir)
            .await
            .map_err(|e| BuildError::io(&site_dir, e))?;

        let built_at = Utc::now();
        let root = reserve_build_dir(&site_dir, built_at.timestamp_millis()).await?;

        match self.write_artifact(model, &root).await {
            Ok((manifest, reports)) => {
                prune_builds(&site_dir, &root).await;
                tracing::info!(
                    site_id,
                    pages = manifest.pages.len(),
                    path = %root.display(),
                    "Site built"
                );
                Ok(BuildArtifact {
                    site_id,
                    root,
                    built_at,
                    manifest,
                    reports,
                })
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&root).await {
                    tracing::warn!(path = %root.display(), error = %cleanup, "Failed to remove partial build");
                }
                Err(e)
            }
        }
    }

    /// Removes every local build of a site. Returns whether anything existed.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Io`] if the directory exists but cannot be removed.
    pub async fn cleanup(&self, site_id: i64) -> Result<bool, BuildError> {
        remove_tree(&self.site_dir(site_id)).await
    }

    async fn write_artifact(
        &self,
        model: &SiteModel,
        root: &Path,
    ) -> Result<(Manifest, Vec<PageReport>), BuildError> {
        let public = root.join(PUBLIC_DIR);
        fs::create_dir_all(&public)
            .await
            .map_err(|e| BuildError::io(&public, e))?;

        let css = stylesheet(&model.theme).unwrap_or_else(|e| {
            tracing::error!(site_id = model.site.id, error = %e, "Stylesheet template failed");
            String::new()
        });
        write(&public.join(STYLESHEET_FILE), css.as_bytes()).await?;

        let (documents, manifest_pages, reports) = self.render_pages(model);
        for doc in &documents {
            let path = root.join(&doc.relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| BuildError::io(parent, e))?;
            }
            write(&path, doc.html.as_bytes()).await?;
        }

        let manifest = Manifest {
            site_id: model.site.id,
            site_name: model.site.name.clone(),
            domain: model.site.domain.clone(),
            revision: model.revision,
            pages: manifest_pages,
            assets: vec![format!("{PUBLIC_DIR}/{STYLESHEET_FILE}")],
        };
        let encoded = serde_json::to_vec_pretty(&manifest).map_err(|source| BuildError::Encode {
            file: MANIFEST_FILE,
            source,
        })?;
        write(&root.join(MANIFEST_FILE), &encoded).await?;

        let package = serde_json::to_vec_pretty(&package_json(model.site.id)).map_err(|source| {
            BuildError::Encode {
                file: PACKAGE_FILE,
                source,
            }
        })?;
        write(&root.join(PACKAGE_FILE), &package).await?;

        Ok((manifest, reports))
    }

    fn render_pages(&self, model: &SiteModel) -> (Vec<Document>, Vec<ManifestPage>, Vec<PageReport>) {
        let slugs = assign_slugs(&model.pages);
        let nav: Vec<NavItem> = model
            .pages
            .iter()
            .zip(&slugs)
            .map(|(page, slug)| NavItem {
                page_id: page.id,
                title: nav_title(page),
                href: href_for(&slug.value),
            })
            .collect();
        let sheet = Stylesheet::Linked(format!("/{STYLESHEET_FILE}"));
        let ctx = PageContext {
            site_name: &model.site.name,
            theme: &model.theme,
            nav: &nav,
            stylesheet: &sheet,
        };

        let mut documents = Vec::with_capacity(model.pages.len());
        let mut manifest = Vec::with_capacity(model.pages.len());
        let mut reports = Vec::with_capacity(model.pages.len());

        for (page, slug) in model.pages.iter().zip(slugs) {
            let relative = file_for(&slug.value);
            let mut diagnostics = Vec::new();

            if let Some(original) = &slug.renamed_from {
                diagnostics.push(RenderDiagnostic::warning(
                    "page",
                    format!("slug '{original}' is invalid or already taken; published as '{}'", slug.value),
                ));
            }
            if let Some(degraded) = model.degraded.iter().find(|d| d.page_id == page.id) {
                diagnostics.push(RenderDiagnostic::error(
                    "page",
                    format!("content could not be parsed: {}", degraded.reason),
                ));
            }

            let renderer = self.renderer;
            let outcome = catch_unwind(AssertUnwindSafe(|| renderer(page, ctx)));
            let (html, placeholder) = match outcome {
                Ok(Ok(rendered)) => {
                    diagnostics.extend(rendered.diagnostics);
                    (rendered.html, false)
                }
                Ok(Err(e)) => {
                    tracing::error!(page_id = page.id, error = %e, "Page render failed");
                    diagnostics.push(RenderDiagnostic::error("page", format!("render failed: {e}")));
                    (placeholder_page(page, &sheet), true)
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(page_id = page.id, %message, "Page renderer panicked");
                    diagnostics.push(RenderDiagnostic::error("page", format!("renderer panicked: {message}")));
                    (placeholder_page(page, &sheet), true)
                }
            };

            manifest.push(ManifestPage {
                slug: slug.value.clone(),
                file: relative.clone(),
                page_id: page.id,
                title: page.title.clone(),
                partial: page.partial,
                placeholder,
                diagnostics: diagnostics.len(),
            });
            reports.push(PageReport {
                slug: slug.value,
                file: relative.clone(),
                partial: page.partial,
                placeholder,
                diagnostics,
            });
            documents.push(Document { relative, html });
        }

        (documents, manifest, reports)
    }
}

/// Final slug of one page and the stored slug it replaced, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AssignedSlug {
    value: String,
    renamed_from: Option<String>,
}

/// Assigns every page a unique, path-safe slug. The first home page keeps
/// the site root; later ones are renamed like any other collision.
fn assign_slugs(pages: &[ResolvedPage]) -> Vec<AssignedSlug> {
    let mut taken: HashSet<String> = HashSet::new();
    let mut home_taken = false;

    pages
        .iter()
        .map(|page| {
            if is_home_slug(&page.slug) && !home_taken {
                home_taken = true;
                return AssignedSlug {
                    value: page.slug.clone(),
                    renamed_from: None,
                };
            }

            let clean = sanitize_slug(&page.slug);
            let candidate = match clean {
                Some(s) if !is_home_slug(&s) && !taken.contains(&s) => s,
                _ => {
                    let base = format!("page-{}", page.id);
                    let mut value = base.clone();
                    let mut n = 2;
                    while taken.contains(&value) {
                        value = format!("{base}-{n}");
                        n += 1;
                    }
                    value
                }
            };
            taken.insert(candidate.clone());

            AssignedSlug {
                renamed_from: (candidate != page.slug).then(|| page.slug.clone()),
                value: candidate,
            }
        })
        .collect()
}

/// Lowercases and reduces a slug to `[a-z0-9-]`, or `None` if nothing is left.
fn sanitize_slug(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
        if out.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    let trimmed = out.trim_end_matches('-');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn file_for(slug: &str) -> String {
    if is_home_slug(slug) {
        format!("{PUBLIC_DIR}/index.html")
    } else {
        format!("{PUBLIC_DIR}/{slug}/index.html")
    }
}

fn href_for(slug: &str) -> String {
    if is_home_slug(slug) {
        "/".to_string()
    } else {
        format!("/{slug}/")
    }
}

fn nav_title(page: &ResolvedPage) -> String {
    if page.title.trim().is_empty() {
        page.slug.clone()
    } else {
        page.title.clone()
    }
}

fn placeholder_page(page: &ResolvedPage, sheet: &Stylesheet) -> String {
    render_error_page(
        &nav_title(page),
        "This page could not be rendered. The rest of the site is unaffected.",
        sheet,
    )
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn package_json(site_id: i64) -> serde_json::Value {
    json!({
        "name": site_key(site_id),
        "version": "1.0.0",
        "private": true,
        "scripts": {
            "build": format!("test -d {PUBLIC_DIR}"),
            "start": format!("serve {PUBLIC_DIR} -l tcp://0.0.0.0:${{PORT:-3000}}")
        },
        "dependencies": {
            "serve": "^14.2.0"
        }
    })
}

async fn write(path: &Path, bytes: &[u8]) -> Result<(), BuildError> {
    fs::write(path, bytes)
        .await
        .map_err(|e| BuildError::io(path, e))
}

/// Creates a fresh build directory, stepping past a same-millisecond build.
async fn reserve_build_dir(site_dir: &Path, mut ts: i64) -> Result<PathBuf, BuildError> {
    loop {
        let dir = site_dir.join(ts.to_string());
        match fs::create_dir(&dir).await {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => ts += 1,
            Err(e) => return Err(BuildError::io(&dir, e)),
        }
    }
}

/// Deletes every build of the site except `keep`. Failures are logged only.
async fn prune_builds(site_dir: &Path, keep: &Path) {
    let mut entries = match fs::read_dir(site_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %site_dir.display(), error = %e, "Cannot list old builds");
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path == keep {
            continue;
        }
        match remove_tree(&path).await {
            Ok(_) => tracing::debug!(path = %path.display(), "Pruned old build"),
            Err(e) => tracing::warn!(error = %e, "Failed to prune old build"),
        }
    }
}

pub(crate) async fn remove_tree(path: &Path) -> Result<bool, BuildError> {
    let removed = match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(BuildError::io(path, e)),
    };
    removed.map(|_| true).map_err(|e| BuildError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{DegradedPage, Section, Site, SiteTheme};
    use chrono::TimeZone;
    use serde_json::Value;

    fn model(pages: Vec<ResolvedPage>) -> SiteModel {
        SiteModel {
            site: Site::new(
                7,
                1,
                "Harbour Cafe".to_string(),
                None,
                Value::Null,
                "idle".to_string(),
                Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            ),
            theme: SiteTheme::default(),
            pages,
            degraded: vec![],
            rejected_theme_tokens: vec![],
            media_fallbacks: vec![],
            revision: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn page(id: i64, slug: &str, sections: Vec<Section>) -> ResolvedPage {
        ResolvedPage {
            id,
            slug: slug.to_string(),
            title: slug.to_string(),
            menu_order: id as i32,
            sections,
            partial: false,
        }
    }

    fn unknown() -> Section {
        Section::Unknown {
            kind: "carousel".to_string(),
        }
    }

    #[tokio::test]
    async fn test_zero_pages_builds_empty_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let builder = SiteBuilder::new(dir.path());

        let artifact = builder.build(&model(vec![])).await.unwrap();

        assert_eq!(artifact.page_count(), 0);
        assert!(artifact.public_dir().join(STYLESHEET_FILE).exists());
        assert!(artifact.root.join(MANIFEST_FILE).exists());
        assert!(artifact.root.join(PACKAGE_FILE).exists());
        assert!(!artifact.public_dir().join("index.html").exists());
    }

    #[tokio::test]
    async fn test_writes_documents_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let builder = SiteBuilder::new(dir.path());
        let m = model(vec![page(1, "home", vec![]), page(2, "menu", vec![unknown()])]);

        let artifact = builder.build(&m).await.unwrap();

        let index = std::fs::read_to_string(artifact.public_dir().join("index.html")).unwrap();
        assert!(index.contains("href=\"/menu/\""));
        assert!(index.contains("/styles.css"));

        let menu = std::fs::read_to_string(artifact.public_dir().join("menu/index.html")).unwrap();
        assert!(menu.contains("data-diagnostic"));

        let manifest: Value =
            serde_json::from_slice(&std::fs::read(artifact.root.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(manifest["pages"][0]["file"], "public/index.html");
        assert_eq!(manifest["pages"][1]["file"], "public/menu/index.html");
        assert_eq!(manifest["pages"][1]["diagnostics"], 1);

        let package: Value =
            serde_json::from_slice(&std::fs::read(artifact.root.join(PACKAGE_FILE)).unwrap()).unwrap();
        assert_eq!(package["scripts"]["build"], "test -d public");
    }

    #[tokio::test]
    async fn test_new_build_supersedes_older_builds() {
        let dir = tempfile::tempdir().unwrap();
        let builder = SiteBuilder::new(dir.path());
        let m = model(vec![page(1, "home", vec![])]);

        let first = builder.build(&m).await.unwrap();
        let second = builder.build(&m).await.unwrap();

        assert_ne!(first.root, second.root);
        assert!(!first.root.exists());
        assert!(second.root.exists());
        assert_eq!(std::fs::read_dir(builder.site_dir(7)).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_panicking_page_gets_placeholder() {
        fn explode(page: &ResolvedPage, ctx: PageContext<'_>) -> Result<RenderedPage, askama::Error> {
            if page.slug == "menu" {
                panic!("boom");
            }
            render_page(page, ctx)
        }

        let dir = tempfile::tempdir().unwrap();
        let builder = SiteBuilder::new(dir.path()).with_renderer(explode);
        let m = model(vec![page(1, "home", vec![]), page(2, "menu", vec![])]);

        let artifact = builder.build(&m).await.unwrap();

        assert_eq!(artifact.page_count(), 2);
        assert!(!artifact.manifest.pages[0].placeholder);
        assert!(artifact.manifest.pages[1].placeholder);
        assert!(artifact.reports[1].diagnostics[0].message.contains("boom"));
        let menu = std::fs::read_to_string(artifact.public_dir().join("menu/index.html")).unwrap();
        assert!(menu.contains("could not be rendered"));
    }

    #[tokio::test]
    async fn test_degraded_page_reported() {
        let dir = tempfile::tempdir().unwrap();
        let builder = SiteBuilder::new(dir.path());
        let mut broken = page(3, "about", vec![Section::Malformed {
            kind: "page".to_string(),
            reason: "not a list".to_string(),
        }]);
        broken.partial = true;
        let mut m = model(vec![broken]);
        m.degraded.push(DegradedPage {
            page_id: 3,
            slug: "about".to_string(),
            reason: "not a list".to_string(),
        });

        let artifact = builder.build(&m).await.unwrap();

        assert!(artifact.manifest.pages[0].partial);
        assert!(
            artifact.reports[0]
                .diagnostics
                .iter()
                .any(|d| d.message.contains("not a list"))
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_site_builds() {
        let dir = tempfile::tempdir().unwrap();
        let builder = SiteBuilder::new(dir.path());
        builder.build(&model(vec![])).await.unwrap();

        assert!(builder.cleanup(7).await.unwrap());
        assert!(!builder.site_dir(7).exists());
        assert!(!builder.cleanup(7).await.unwrap());
    }

    #[test]
    fn test_slug_sanitising_and_collisions() {
        let pages = vec![
            page(1, "index", vec![]),
            page(2, "home", vec![]),
            page(3, "Our Menu!", vec![]),
            page(4, "our-menu", vec![]),
            page(5, "../../etc", vec![]),
            page(6, "???", vec![]),
        ];

        let slugs: Vec<String> = assign_slugs(&pages).into_iter().map(|s| s.value).collect();

        assert_eq!(slugs, vec!["index", "page-2", "our-menu", "page-4", "etc", "page-6"]);
    }

    #[test]
    fn test_renamed_slug_is_recorded() {
        let assigned = assign_slugs(&[page(3, "Our Menu", vec![])]);
        assert_eq!(assigned[0].renamed_from.as_deref(), Some("Our Menu"));
        assert_eq!(file_for(&assigned[0].value), "public/our-menu/index.html");
    }
}
