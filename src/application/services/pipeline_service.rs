//! Pipeline orchestration.
//!
//! [`PipelineService`] is the single entry point used by the HTTP API and the
//! admin CLI. It sequences the resolver, builder, packager and deployer and
//! keeps the deployment ledger current while doing so.
//!
//! Builds of one site are serialized: a `generate` issued during a deploy
//! waits until the deploy has packaged its artifact, so pruning never removes
//! a build that is about to be bundled.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::content_resolver::ContentResolver;
use super::deployment_ledger::{AttemptHandle, DeploymentLedger};
use super::packager::Packager;
use super::remote_deployer::{DeployTarget, Deployed, RemoteDeployer, StageFailure, enter};
use super::site_builder::SiteBuilder;
use crate::application::render::{
    PageContext, RenderDiagnostic, Stylesheet, render_error_page, render_page, stylesheet,
};
use crate::domain::entities::{
    DegradedPage, DeployStage, DeploymentAttempt, DeploymentRecord, LiveRelease, PageReport,
    StateDetail,
};
use crate::domain::errors::{LedgerError, PipelineError, ResolveError};
use crate::domain::remote::HostConfig;
use crate::domain::repositories::ContentRepository;

/// Outcome of a local build.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateReport {
    pub site_id: i64,
    pub artifact_path: String,
    pub built_at: DateTime<Utc>,
    pub page_count: usize,
    /// The site has no published pages; the artifact holds only the shared assets.
    pub no_published_pages: bool,
    pub pages: Vec<PageReport>,
    pub degraded: Vec<DegradedPage>,
    /// Media ids whose URLs came from the fallback base.
    pub media_fallbacks: Vec<i64>,
    pub rejected_theme_tokens: Vec<String>,
}

/// Input of a deploy run.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Must already satisfy [`is_valid_domain`](super::remote_deployer::is_valid_domain).
    pub domain: String,
    pub host: HostConfig,
}

/// A single page rendered for preview.
#[derive(Debug, Clone)]
pub struct PreviewPage {
    pub html: String,
    pub diagnostics: Vec<RenderDiagnostic>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub site_id: i64,
    pub builds_removed: bool,
    pub bundles_removed: bool,
}

/// Dependency probes; `Err` carries a human readable reason.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub database: Result<(), String>,
    pub build_root: Result<(), String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.database.is_ok() && self.build_root.is_ok()
    }
}

pub struct PipelineService {
    content: Arc<dyn ContentRepository>,
    resolver: Arc<ContentResolver>,
    builder: Arc<SiteBuilder>,
    packager: Arc<Packager>,
    deployer: Arc<RemoteDeployer>,
    ledger: Arc<DeploymentLedger>,
    build_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl PipelineService {
    pub fn new(
        content: Arc<dyn ContentRepository>,
        resolver: Arc<ContentResolver>,
        builder: Arc<SiteBuilder>,
        packager: Arc<Packager>,
        deployer: Arc<RemoteDeployer>,
        ledger: Arc<DeploymentLedger>,
    ) -> Self {
        Self {
            content,
            resolver,
            builder,
            packager,
            deployer,
            ledger,
            build_locks: DashMap::new(),
        }
    }

    pub fn ledger(&self) -> &DeploymentLedger {
        &self.ledger
    }

    fn build_lock(&self, site_id: i64) -> Arc<Mutex<()>> {
        self.build_locks.entry(site_id).or_default().clone()
    }

    /// Resolves and builds a site locally without deploying it.
    ///
    /// # Errors
    ///
    /// Fails at [`DeployStage::Generating`] when the site is missing, the
    /// content store is unavailable, or the artifact cannot be written.
    #[tracing::instrument(skip(self))]
    pub async fn generate(&self, site_id: i64) -> Result<GenerateReport, PipelineError> {
        let lock = self.build_lock(site_id);
        let _guard = lock.lock().await;

        let outcome = async {
            let model = self.resolver.resolve(site_id).await?;
            let artifact = self.builder.build(&model).await?;
            Ok::<_, crate::domain::errors::PipelineCause>((model, artifact))
        }
        .await;

        let (model, artifact) = match outcome {
            Ok(built) => built,
            Err(cause) => {
                metrics::counter!("pipeline_generate_total", "outcome" => "error").increment(1);
                return Err(PipelineError::at(DeployStage::Generating, cause, None));
            }
        };
        metrics::counter!("pipeline_generate_total", "outcome" => "ok").increment(1);

        tracing::info!(
            site_id,
            pages = artifact.page_count(),
            degraded = model.degraded.len(),
            path = %artifact.root.display(),
            "Site generated"
        );

        Ok(GenerateReport {
            site_id,
            artifact_path: artifact.root.display().to_string(),
            built_at: artifact.built_at,
            page_count: artifact.page_count(),
            no_published_pages: model.has_no_published_pages(),
            pages: artifact.reports,
            degraded: model.degraded,
            media_fallbacks: model.media_fallbacks,
            rejected_theme_tokens: model.rejected_theme_tokens,
        })
    }

    /// Runs the full pipeline for one site and returns the final ledger row.
    ///
    /// At most one deploy per site runs at a time; a second request is refused
    /// with [`LedgerError::DeployInProgress`] before any stage starts. A failure
    /// before routing is committed leaves the previously live release serving.
    ///
    /// # Errors
    ///
    /// Returns the failing stage with its cause and the ledger row written for
    /// the failure. Cancelled runs report [`PipelineError::is_cancelled`].
    #[tracing::instrument(skip(self, request), fields(domain = %request.domain))]
    pub async fn deploy(
        &self,
        site_id: i64,
        request: DeployRequest,
    ) -> Result<DeploymentRecord, PipelineError> {
        self.ensure_site(site_id).await?;

        let (record, handle) = self.ledger.begin(site_id, &request.domain).await?;
        tracing::info!(site_id, attempt = %handle.attempt_id, "Deploy started");

        match self.run(&handle, &request, record.live.as_ref()).await {
            Ok(deployed) => match self.ledger.go_live(&handle, deployed.live, deployed.notice).await {
                Ok(record) => {
                    metrics::counter!("pipeline_deploy_total", "outcome" => "live").increment(1);
                    tracing::info!(site_id, attempt = %handle.attempt_id, "Deploy live");
                    Ok(record)
                }
                Err(e) => {
                    metrics::counter!("pipeline_deploy_total", "outcome" => "error").increment(1);
                    let stage = DeployStage::RoutingConfigured;
                    metrics::counter!("pipeline_stage_failures_total", "stage" => stage.as_str())
                        .increment(1);
                    let record = self.ledger.get(site_id).await.ok().flatten();
                    Err(PipelineError::at(stage, e, record))
                }
            },
            Err(failure) => Err(self.abort(&handle, failure).await),
        }
    }

    async fn ensure_site(&self, site_id: i64) -> Result<(), PipelineError> {
        match self.content.find_site(site_id).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(ResolveError::NotFound(site_id).into()),
            Err(e) => Err(ResolveError::Store(e.to_string()).into()),
        }
    }

    async fn run(
        &self,
        handle: &AttemptHandle,
        request: &DeployRequest,
        previous: Option<&LiveRelease>,
    ) -> Result<Deployed, StageFailure> {
        let site_id = handle.site_id;
        let bundle = {
            let lock = self.build_lock(site_id);
            let _guard = lock.lock().await;

            enter(handle, &self.ledger, DeployStage::Generating, StateDetail::default()).await?;
            let model = self
                .resolver
                .resolve(site_id)
                .await
                .map_err(|e| StageFailure::new(DeployStage::Generating, e))?;
            let artifact = self
                .builder
                .build(&model)
                .await
                .map_err(|e| StageFailure::new(DeployStage::Generating, e))?;

            enter(handle, &self.ledger, DeployStage::Packaging, StateDetail::default()).await?;
            self.packager
                .package(&artifact)
                .await
                .map_err(|e| StageFailure::new(DeployStage::Packaging, e))?
        };

        let target = DeployTarget {
            host: &request.host,
            domain: &request.domain,
            bundle: &bundle,
            previous,
        };
        let result = self.deployer.deploy(target, handle, &self.ledger).await;
        self.packager.discard(&bundle).await;
        result
    }

    async fn abort(&self, handle: &AttemptHandle, failure: StageFailure) -> PipelineError {
        let stage = failure.stage;
        let written = if failure.is_cancelled() {
            metrics::counter!("pipeline_deploy_total", "outcome" => "cancelled").increment(1);
            tracing::warn!(site_id = handle.site_id, %stage, "Deploy cancelled");
            self.ledger.cancelled(handle, stage).await
        } else {
            metrics::counter!("pipeline_deploy_total", "outcome" => "error").increment(1);
            metrics::counter!("pipeline_stage_failures_total", "stage" => stage.as_str())
                .increment(1);
            tracing::error!(site_id = handle.site_id, %stage, error = %failure.cause, "Deploy failed");
            self.ledger
                .fail(handle, stage, failure.cause.to_string(), failure.command_output())
                .await
        };

        let record = written
            .map_err(|e| {
                tracing::error!(site_id = handle.site_id, error = %e, "Failed to record deploy failure");
            })
            .ok();
        PipelineError::at(stage, failure.cause, record)
    }

    /// Current ledger row of a site, `None` if it was never deployed.
    pub async fn status(&self, site_id: i64) -> Result<Option<DeploymentRecord>, LedgerError> {
        self.ledger.get(site_id).await
    }

    /// Requests cancellation of the site's in-flight deploy.
    pub async fn cancel(&self, site_id: i64) -> Result<DeploymentRecord, LedgerError> {
        self.ledger.cancel(site_id).await
    }

    pub async fn history(
        &self,
        site_id: i64,
        limit: i64,
    ) -> Result<Vec<DeploymentAttempt>, LedgerError> {
        self.ledger.history(site_id, limit).await
    }

    /// Renders one published page with the build's section renderers.
    ///
    /// The stylesheet is embedded and navigation is omitted; the `<main>`
    /// content matches what a build writes for the same page.
    pub async fn preview(&self, site_id: i64, slug: &str) -> Result<PreviewPage, ResolveError> {
        let model = self.resolver.resolve_page(site_id, slug).await?;
        let Some(page) = model.pages.first() else {
            return Err(ResolveError::PageNotFound {
                site_id,
                slug: slug.to_string(),
            });
        };

        let css = stylesheet(&model.theme).unwrap_or_else(|e| {
            tracing::error!(site_id, error = %e, "Stylesheet render failed");
            String::new()
        });
        let sheet = Stylesheet::Inline(css);
        let ctx = PageContext {
            site_name: &model.site.name,
            theme: &model.theme,
            nav: &[],
            stylesheet: &sheet,
        };

        let mut diagnostics = Vec::new();
        if let Some(degraded) = model.degraded.first() {
            diagnostics.push(RenderDiagnostic::error(
                "page",
                format!("content could not be parsed: {}", degraded.reason),
            ));
        }

        match render_page(page, ctx) {
            Ok(rendered) => {
                diagnostics.extend(rendered.diagnostics);
                Ok(PreviewPage {
                    html: rendered.html,
                    diagnostics,
                })
            }
            Err(e) => {
                tracing::error!(site_id, slug, error = %e, "Preview render failed");
                diagnostics.push(RenderDiagnostic::error("page", format!("render failed: {e}")));
                Ok(PreviewPage {
                    html: render_error_page(
                        &page.title,
                        "This page could not be rendered.",
                        &sheet,
                    ),
                    diagnostics,
                })
            }
        }
    }

    /// Removes every local build and bundle of a site.
    ///
    /// # Errors
    ///
    /// Refused with [`LedgerError::DeployInProgress`] while a deploy runs.
    pub async fn cleanup(&self, site_id: i64) -> Result<CleanupReport, PipelineError> {
        if self.ledger.is_in_flight(site_id) {
            return Err(LedgerError::DeployInProgress { site_id }.into());
        }
        let lock = self.build_lock(site_id);
        let _guard = lock.lock().await;

        let builds_removed = self
            .builder
            .cleanup(site_id)
            .await
            .map_err(PipelineError::before_start)?;
        let bundles_removed = self
            .packager
            .cleanup(site_id)
            .await
            .map_err(PipelineError::before_start)?;

        tracing::info!(site_id, builds_removed, bundles_removed, "Local artifacts removed");
        Ok(CleanupReport {
            site_id,
            builds_removed,
            bundles_removed,
        })
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            database: self.content.ping().await.map_err(|e| e.to_string()),
            build_root: probe_writable(self.builder.build_root()).await,
        }
    }
}

async fn probe_writable(root: &Path) -> Result<(), String> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| format!("{}: {e}", root.display()))?;
    let probe = root.join(format!(".probe-{}", Uuid::new_v4()));
    tokio::fs::write(&probe, b"ok")
        .await
        .map_err(|e| format!("{}: {e}", root.display()))?;
    if let Err(e) = tokio::fs::remove_file(&probe).await {
        tracing::debug!(path = %probe.display(), error = %e, "Failed to remove write probe");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::packager::DescriptorTemplate;
    use crate::application::services::remote_deployer::DeployerSettings;
    use crate::domain::entities::{Page, PipelineState, Site};
    use crate::domain::errors::PipelineCause;
    use crate::domain::remote::{HostAuth, MockRemoteConnector};
    use crate::domain::repositories::{MockContentRepository, MockDeploymentRepository};
    use crate::error::AppError;
    use crate::infrastructure::media::MediaStorage;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use tempfile::TempDir;

    fn site() -> Site {
        Site::new(
            3,
            1,
            "Harbour Cafe".to_string(),
            Some("harbour.example.test".to_string()),
            json!({ "primaryColor": "#224466" }),
            "idle".to_string(),
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        )
    }

    fn home() -> Page {
        Page::new(
            7,
            3,
            "home".to_string(),
            "Welcome".to_string(),
            true,
            1,
            json!([{ "type": "text", "data": { "body": "Fresh coffee daily" } }]),
            Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
        )
    }

    fn content_repo() -> MockContentRepository {
        let mut repo = MockContentRepository::new();
        repo.expect_find_site()
            .returning(|id| Ok((id == 3).then(site)));
        repo.expect_list_published_pages()
            .returning(|_| Ok(vec![home()]));
        repo.expect_find_published_page()
            .returning(|_, slug| Ok((slug == "home").then(home)));
        repo.expect_find_media().returning(|_, _| Ok(vec![]));
        repo.expect_recent_posts().returning(|_, _| Ok(vec![]));
        repo
    }

    fn service(
        dir: &TempDir,
        content: MockContentRepository,
        deployments: MockDeploymentRepository,
    ) -> PipelineService {
        let content: Arc<dyn ContentRepository> = Arc::new(content);
        let media = Arc::new(MediaStorage::fallback_only("/media"));
        PipelineService::new(
            content.clone(),
            Arc::new(ContentResolver::new(content, media)),
            Arc::new(SiteBuilder::new(dir.path().join("builds"))),
            Arc::new(Packager::new(
                dir.path().join("bundles"),
                DescriptorTemplate::default(),
            )),
            Arc::new(RemoteDeployer::new(
                Arc::new(MockRemoteConnector::new()),
                DeployerSettings::default(),
            )),
            Arc::new(DeploymentLedger::new(
                Arc::new(deployments),
                Duration::minutes(30),
            )),
        )
    }

    fn request() -> DeployRequest {
        DeployRequest {
            domain: "harbour.example.test".to_string(),
            host: HostConfig {
                address: "203.0.113.10".to_string(),
                port: 22,
                user: "deploy".to_string(),
                auth: HostAuth::Agent,
                remote_root: "/srv/sites".to_string(),
                app_port: 4100,
            },
        }
    }

    #[tokio::test]
    async fn test_generate_reports_pages() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, content_repo(), MockDeploymentRepository::new());

        let report = svc.generate(3).await.unwrap();

        assert_eq!(report.page_count, 1);
        assert!(!report.no_published_pages);
        assert_eq!(report.pages[0].file, "public/index.html");
        assert!(Path::new(&report.artifact_path).join("public/index.html").exists());
    }

    #[tokio::test]
    async fn test_generate_missing_site_fails_at_generating() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, content_repo(), MockDeploymentRepository::new());

        let err = svc.generate(99).await.unwrap_err();

        assert_eq!(err.stage, Some(DeployStage::Generating));
        assert!(matches!(
            err.cause,
            PipelineCause::Resolve(ResolveError::NotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_deploy_unknown_site_never_reserves() {
        let dir = TempDir::new().unwrap();
        let mut deployments = MockDeploymentRepository::new();
        deployments.expect_try_begin().never();
        let svc = service(&dir, content_repo(), deployments);

        let err = svc.deploy(99, request()).await.unwrap_err();

        assert!(err.stage.is_none());
        assert!(matches!(
            err.cause,
            PipelineCause::Resolve(ResolveError::NotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_deploy_refused_while_in_progress() {
        let dir = TempDir::new().unwrap();
        let mut deployments = MockDeploymentRepository::new();
        deployments.expect_try_begin().returning(|_, _, _, _| Ok(None));
        let svc = service(&dir, content_repo(), deployments);

        let err = svc.deploy(3, request()).await.unwrap_err();

        assert!(err.stage.is_none());
        assert!(matches!(
            err.cause,
            PipelineCause::Ledger(LedgerError::DeployInProgress { site_id: 3 })
        ));
    }

    #[tokio::test]
    async fn test_preview_embeds_stylesheet() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, content_repo(), MockDeploymentRepository::new());

        let page = svc.preview(3, "home").await.unwrap();

        assert!(page.html.contains("<style"));
        assert!(page.html.contains("Fresh coffee daily"));
        assert!(!page.html.contains("/styles.css"));
    }

    #[tokio::test]
    async fn test_preview_unknown_slug() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, content_repo(), MockDeploymentRepository::new());

        let err = svc.preview(3, "missing").await.unwrap_err();
        assert!(matches!(err, ResolveError::PageNotFound { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_removes_builds() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, content_repo(), MockDeploymentRepository::new());
        svc.generate(3).await.unwrap();

        let report = svc.cleanup(3).await.unwrap();

        assert!(report.builds_removed);
        assert!(!report.bundles_removed);
        assert!(!dir.path().join("builds/site-3").exists());
    }

    #[tokio::test]
    async fn test_cleanup_refused_during_deploy() {
        let dir = TempDir::new().unwrap();
        let mut deployments = MockDeploymentRepository::new();
        deployments.expect_try_begin().returning(|site_id, attempt_id, domain, _| {
            let now = Utc::now();
            Ok(Some(DeploymentRecord {
                site_id,
                attempt_id,
                state: PipelineState::Queued,
                stage: None,
                domain: domain.to_string(),
                remote_path: None,
                bundle_digest: None,
                last_error: None,
                command_output: None,
                live: None,
                started_at: now,
                updated_at: now,
                finished_at: None,
            }))
        });
        let svc = service(&dir, content_repo(), deployments);
        let (_, _handle) = svc.ledger().begin(3, "harbour.example.test").await.unwrap();

        let err = svc.cleanup(3).await.unwrap_err();
        assert!(matches!(
            err.cause,
            PipelineCause::Ledger(LedgerError::DeployInProgress { site_id: 3 })
        ));
    }

    #[tokio::test]
    async fn test_health_reports_database_failure() {
        let dir = TempDir::new().unwrap();
        let mut content = MockContentRepository::new();
        content
            .expect_ping()
            .returning(|| Err(AppError::internal("connection refused", json!({}))));
        let svc = service(&dir, content, MockDeploymentRepository::new());

        let report = svc.health().await;

        assert!(!report.is_healthy());
        assert!(report.database.is_err());
        assert!(report.build_root.is_ok());
    }
}
