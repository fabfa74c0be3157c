#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use serde_json::{Value, json};
use site_pipeline::application::services::{
    AuthService, ContentResolver, DeployRequest, DeployerSettings, DeploymentLedger,
    DescriptorTemplate, Packager, PipelineService, RemoteDeployer, SiteBuilder,
};
use site_pipeline::domain::entities::{
    BlogPostSummary, DeployStage, DeploymentAttempt, DeploymentRecord, LiveRelease, MediaAsset, Page,
    PipelineState, Site, StateDetail,
};
use site_pipeline::domain::remote::{
    CommandOutput, HostAuth, HostConfig, RemoteConnector, RemoteError, RemoteSession,
};
use site_pipeline::domain::repositories::{
    ApiToken, ContentRepository, DeploymentRepository, TokenRepository,
};
use site_pipeline::error::AppError;
use site_pipeline::infrastructure::media::MediaStorage;
use site_pipeline::state::AppState;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use uuid::Uuid;

pub const SIGNING_SECRET: &str = "test-signing-secret";
pub const SITE_ID: i64 = 3;

// ── Content ──────────────────────────────────────────────────────────────────

pub fn test_site(id: i64) -> Site {
    Site::new(
        id,
        1,
        "Harbour Cafe".to_string(),
        Some("harbour.example.test".to_string()),
        json!({ "primaryColor": "#224466", "heroStyle": "plain" }),
        "idle".to_string(),
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    )
}

pub fn test_page(id: i64, site_id: i64, slug: &str, order: i32, content: Value) -> Page {
    Page::new(
        id,
        site_id,
        slug.to_string(),
        slug.to_uppercase(),
        true,
        order,
        content,
        Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
    )
}

/// A home page and a menu page with a media image.
pub fn cafe_pages(site_id: i64) -> Vec<Page> {
    vec![
        test_page(
            10,
            site_id,
            "home",
            1,
            json!([
                { "type": "hero", "data": { "title": "Harbour Cafe", "subtitle": "By the water" } },
                { "type": "text", "data": { "body": "Fresh coffee daily" } }
            ]),
        ),
        test_page(
            11,
            site_id,
            "menu",
            2,
            json!([
                { "type": "image", "data": { "image": 40, "caption": "Espresso" } }
            ]),
        ),
    ]
}

#[derive(Default)]
pub struct MemoryContentRepository {
    pub sites: Mutex<Vec<Site>>,
    pub pages: Mutex<Vec<Page>>,
    pub media: Mutex<Vec<MediaAsset>>,
    pub posts: Mutex<Vec<BlogPostSummary>>,
    pub unavailable: Mutex<bool>,
}

impl MemoryContentRepository {
    pub fn with_cafe() -> Self {
        let repo = Self::default();
        repo.sites.lock().unwrap().push(test_site(SITE_ID));
        *repo.pages.lock().unwrap() = cafe_pages(SITE_ID);
        repo.media.lock().unwrap().push(MediaAsset {
            id: 40,
            site_id: SITE_ID,
            storage_key: "site-3/espresso.jpg".to_string(),
            alt_text: Some("A cup of espresso".to_string()),
            created_at: Utc::now(),
        });
        repo
    }

    fn check(&self) -> Result<(), AppError> {
        if *self.unavailable.lock().unwrap() {
            return Err(AppError::internal("content store unavailable", json!({})));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentRepository for MemoryContentRepository {
    async fn find_site(&self, site_id: i64) -> Result<Option<Site>, AppError> {
        self.check()?;
        Ok(self
            .sites
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == site_id)
            .cloned())
    }

    async fn list_published_pages(&self, site_id: i64) -> Result<Vec<Page>, AppError> {
        self.check()?;
        Ok(self
            .pages
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.site_id == site_id && p.published)
            .cloned()
            .collect())
    }

    async fn find_published_page(
        &self,
        site_id: i64,
        slug: &str,
    ) -> Result<Option<Page>, AppError> {
        self.check()?;
        Ok(self
            .pages
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.site_id == site_id && p.published && p.slug == slug)
            .cloned())
    }

    async fn find_media(&self, site_id: i64, ids: &[i64]) -> Result<Vec<MediaAsset>, AppError> {
        self.check()?;
        Ok(self
            .media
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.site_id == site_id && ids.contains(&m.id))
            .cloned()
            .collect())
    }

    async fn recent_posts(
        &self,
        _site_id: i64,
        limit: i64,
    ) -> Result<Vec<BlogPostSummary>, AppError> {
        self.check()?;
        Ok(self
            .posts
            .lock()
            .unwrap()
            .iter()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), AppError> {
        self.check()
    }
}

// ── Deployments ──────────────────────────────────────────────────────────────

/// Mirrors the conditional upsert of the PostgreSQL ledger.
#[derive(Default)]
pub struct MemoryDeploymentRepository {
    pub records: Mutex<HashMap<i64, DeploymentRecord>>,
    pub attempts: Mutex<Vec<DeploymentAttempt>>,
    /// Number of upcoming `mark_live` calls that fail as if the store were down.
    pub mark_live_failures: Mutex<u32>,
}

fn lost_ownership() -> AppError {
    AppError::conflict("Deployment attempt no longer owns the record", json!({}))
}

#[async_trait]
impl DeploymentRepository for MemoryDeploymentRepository {
    async fn find(&self, site_id: i64) -> Result<Option<DeploymentRecord>, AppError> {
        Ok(self.records.lock().unwrap().get(&site_id).cloned())
    }

    async fn try_begin(
        &self,
        site_id: i64,
        attempt_id: Uuid,
        domain: &str,
        stale_after: ChronoDuration,
    ) -> Result<Option<DeploymentRecord>, AppError> {
        let mut records = self.records.lock().unwrap();
        let now = Utc::now();

        let live = match records.get(&site_id) {
            Some(existing)
                if !existing.state.is_terminal() && existing.updated_at >= now - stale_after =>
            {
                return Ok(None);
            }
            Some(existing) => existing.live.clone(),
            None => None,
        };

        let record = DeploymentRecord {
            site_id,
            attempt_id,
            state: PipelineState::Queued,
            stage: None,
            domain: domain.to_string(),
            remote_path: None,
            bundle_digest: None,
            last_error: None,
            command_output: None,
            live,
            started_at: now,
            updated_at: now,
            finished_at: None,
        };
        records.insert(site_id, record.clone());
        Ok(Some(record))
    }

    async fn transition(
        &self,
        site_id: i64,
        attempt_id: Uuid,
        state: PipelineState,
        stage: Option<DeployStage>,
        detail: StateDetail,
    ) -> Result<DeploymentRecord, AppError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&site_id)
            .filter(|r| r.attempt_id == attempt_id)
            .ok_or_else(lost_ownership)?;

        record.state = state;
        record.stage = stage;
        if detail.remote_path.is_some() {
            record.remote_path = detail.remote_path;
        }
        if detail.bundle_digest.is_some() {
            record.bundle_digest = detail.bundle_digest;
        }
        if detail.last_error.is_some() {
            record.last_error = detail.last_error;
        }
        if detail.command_output.is_some() {
            record.command_output = detail.command_output;
        }
        record.updated_at = Utc::now();
        record.finished_at = state.is_terminal().then(Utc::now);
        Ok(record.clone())
    }

    async fn mark_live(
        &self,
        site_id: i64,
        attempt_id: Uuid,
        live: LiveRelease,
        notice: Option<String>,
    ) -> Result<DeploymentRecord, AppError> {
        {
            let mut failures = self.mark_live_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(AppError::internal("deployment store unavailable", json!({})));
            }
        }
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&site_id)
            .filter(|r| r.attempt_id == attempt_id)
            .ok_or_else(lost_ownership)?;

        record.state = PipelineState::Live;
        record.stage = Some(DeployStage::Live);
        record.last_error = None;
        record.command_output = notice;
        record.live = Some(live);
        record.updated_at = Utc::now();
        record.finished_at = Some(Utc::now());
        Ok(record.clone())
    }

    async fn record_attempt(&self, record: DeploymentRecord) -> Result<(), AppError> {
        let mut attempts = self.attempts.lock().unwrap();
        if attempts.iter().any(|a| a.attempt_id == record.attempt_id) {
            return Ok(());
        }
        attempts.push(DeploymentAttempt {
            attempt_id: record.attempt_id,
            site_id: record.site_id,
            state: record.state,
            stage: record.stage,
            domain: record.domain,
            remote_path: record.remote_path,
            bundle_digest: record.bundle_digest,
            last_error: record.last_error,
            started_at: record.started_at,
            finished_at: record.finished_at.unwrap_or_else(Utc::now),
        });
        Ok(())
    }

    async fn history(
        &self,
        site_id: i64,
        limit: i64,
    ) -> Result<Vec<DeploymentAttempt>, AppError> {
        Ok(self
            .attempts
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|a| a.site_id == site_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

// ── Tokens ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryTokenRepository {
    pub tokens: Mutex<Vec<ApiToken>>,
}

#[async_trait]
impl TokenRepository for MemoryTokenRepository {
    async fn find_active(&self, token_hash: &str) -> Result<Option<ApiToken>, AppError> {
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.token_hash == token_hash && t.revoked_at.is_none())
            .cloned())
    }

    async fn touch(&self, id: i64) -> Result<(), AppError> {
        if let Some(t) = self.tokens.lock().unwrap().iter_mut().find(|t| t.id == id) {
            t.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn create_token(&self, name: &str, token_hash: &str) -> Result<ApiToken, AppError> {
        let mut tokens = self.tokens.lock().unwrap();
        let token = ApiToken {
            id: tokens.len() as i64 + 1,
            name: name.to_string(),
            token_hash: token_hash.to_string(),
            created_at: Utc::now(),
            last_used_at: None,
            revoked_at: None,
        };
        tokens.push(token.clone());
        Ok(token)
    }

    async fn list_tokens(&self) -> Result<Vec<ApiToken>, AppError> {
        Ok(self.tokens.lock().unwrap().clone())
    }

    async fn find_by_id_or_name(&self, key: &str) -> Result<Option<ApiToken>, AppError> {
        let id = key.parse::<i64>().ok();
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .iter()
            .find(|t| Some(t.id) == id || t.name == key)
            .cloned())
    }

    async fn revoke_token(&self, id: i64) -> Result<(), AppError> {
        let mut tokens = self.tokens.lock().unwrap();
        match tokens.iter_mut().find(|t| t.id == id && t.revoked_at.is_none()) {
            Some(t) => {
                t.revoked_at = Some(Utc::now());
                Ok(())
            }
            None => Err(AppError::not_found("Active token not found", json!({ "id": id }))),
        }
    }
}

// ── Remote host ──────────────────────────────────────────────────────────────

/// Blocks the first command containing `needle` until released.
pub struct Hold {
    pub needle: &'static str,
    pub reached: Arc<Notify>,
    pub release: Arc<Notify>,
}

/// Scripted stand-in for a target host reachable over ssh.
///
/// Every command succeeds unless it contains one of the `failures` needles.
/// Commands, uploads and written files are recorded in order.
#[derive(Default)]
pub struct FakeHost {
    pub log: Mutex<Vec<String>>,
    pub files: Mutex<HashMap<String, String>>,
    pub failures: Mutex<Vec<(&'static str, CommandOutput)>>,
    pub hold: Mutex<Option<Hold>>,
    pub refuse_connections: Mutex<bool>,
}

impl FakeHost {
    pub fn fail_on(&self, needle: &'static str, exit_code: i32, stderr: &str) {
        self.failures.lock().unwrap().push((
            needle,
            CommandOutput {
                exit_code: Some(exit_code),
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        ));
    }

    /// Installs a hold and returns `(reached, release)`.
    pub fn hold_on(&self, needle: &'static str) -> (Arc<Notify>, Arc<Notify>) {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.hold.lock().unwrap() = Some(Hold {
            needle,
            reached: reached.clone(),
            release: release.clone(),
        });
        (reached, release)
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.commands().iter().any(|c| c.contains(needle))
    }
}

pub struct FakeConnector(pub Arc<FakeHost>);

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(&self, host: &HostConfig) -> Result<Box<dyn RemoteSession>, RemoteError> {
        if *self.0.refuse_connections.lock().unwrap() {
            return Err(RemoteError::Connect(format!(
                "{}: Connection refused",
                host.destination()
            )));
        }
        Ok(Box::new(FakeSession(self.0.clone())))
    }
}

struct FakeSession(Arc<FakeHost>);

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        self.0.log.lock().unwrap().push(command.to_string());

        let held = {
            let mut hold = self.0.hold.lock().unwrap();
            match hold.as_ref() {
                Some(h) if command.contains(h.needle) => hold.take(),
                _ => None,
            }
        };
        if let Some(hold) = held {
            hold.reached.notify_one();
            hold.release.notified().await;
        }

        for (needle, output) in self.0.failures.lock().unwrap().iter() {
            if command.contains(needle) {
                return Ok(output.clone());
            }
        }
        Ok(CommandOutput {
            exit_code: Some(0),
            ..CommandOutput::default()
        })
    }

    async fn upload(&self, local: &Path, remote_path: &str) -> Result<(), RemoteError> {
        assert!(local.exists(), "bundle must exist while uploading");
        self.0.log.lock().unwrap().push(format!("upload {remote_path}"));
        Ok(())
    }

    async fn write_file(&self, remote_path: &str, contents: &str) -> Result<(), RemoteError> {
        self.0.log.lock().unwrap().push(format!("write {remote_path}"));
        self.0
            .files
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), contents.to_string());
        Ok(())
    }

    async fn read_file(&self, remote_path: &str) -> Result<Option<String>, RemoteError> {
        Ok(self.0.files.lock().unwrap().get(remote_path).cloned())
    }

    async fn close(&self) {}
}

// ── Wiring ───────────────────────────────────────────────────────────────────

pub struct Harness {
    pub dir: TempDir,
    pub content: Arc<MemoryContentRepository>,
    pub deployments: Arc<MemoryDeploymentRepository>,
    pub tokens: Arc<MemoryTokenRepository>,
    pub host: Arc<FakeHost>,
    pub pipeline: Arc<PipelineService>,
    pub auth_service: Arc<AuthService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_content(MemoryContentRepository::with_cafe())
    }

    pub fn with_content(content: MemoryContentRepository) -> Self {
        Self::build(content, ChronoDuration::minutes(30))
    }

    /// Treats in-flight deployments as stale after `stale_after`.
    pub fn with_stale_after(stale_after: ChronoDuration) -> Self {
        Self::build(MemoryContentRepository::with_cafe(), stale_after)
    }

    fn build(content: MemoryContentRepository, stale_after: ChronoDuration) -> Self {
        let dir = TempDir::new().unwrap();
        let content = Arc::new(content);
        let deployments = Arc::new(MemoryDeploymentRepository::default());
        let tokens = Arc::new(MemoryTokenRepository::default());
        let host = Arc::new(FakeHost::default());

        let media = Arc::new(MediaStorage::fallback_only("/media"));
        let resolver = Arc::new(ContentResolver::new(content.clone(), media));
        let deployer = Arc::new(RemoteDeployer::new(
            Arc::new(FakeConnector(host.clone())),
            DeployerSettings {
                command_timeout: Duration::from_secs(5),
                upload_backoff: Duration::from_millis(2),
                health_checks: 1,
                ..DeployerSettings::default()
            },
        ));
        let pipeline = Arc::new(PipelineService::new(
            content.clone(),
            resolver,
            Arc::new(SiteBuilder::new(dir.path().join("builds"))),
            Arc::new(Packager::new(
                dir.path().join("bundles"),
                DescriptorTemplate::default(),
            )),
            deployer,
            Arc::new(DeploymentLedger::new(deployments.clone(), stale_after)),
        ));
        let auth_service = Arc::new(AuthService::new(
            tokens.clone(),
            SIGNING_SECRET.to_string(),
        ));

        Self {
            dir,
            content,
            deployments,
            tokens,
            host,
            pipeline,
            auth_service,
        }
    }

    pub fn state(&self) -> AppState {
        AppState::new(self.pipeline.clone(), self.auth_service.clone())
    }

    /// Issues a token and returns its raw value.
    pub async fn token(&self) -> String {
        let (_, raw) = self.auth_service.issue("tests", None).await.unwrap();
        raw
    }
}

pub fn deploy_request() -> DeployRequest {
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

pub fn deploy_body() -> Value {
    json!({
        "domain": "harbour.example.test",
        "host": {
            "address": "203.0.113.10",
            "user": "deploy",
            "auth": { "type": "agent" },
            "remote_root": "/srv/sites",
            "app_port": 4100
        }
    })
}
