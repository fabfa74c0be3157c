//! Remote Deployer: the blue/green state machine run against a target host.
//!
//! ```text
//! Connecting → Uploading → Extracting → Installing → Building
//!            → Supervising → RoutingConfigured → Live
//! ```
//!
//! Nothing before `RoutingConfigured` touches the process or proxy config
//! that serves live traffic, so a failure or cancel at any earlier stage
//! leaves the previous release in place. Release directories are named by
//! bundle digest and carry marker files, so a retry of an unchanged bundle
//! skips the stages it already completed.

use regex::Regex;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;

use super::deployment_ledger::{AttemptHandle, DeploymentLedger};
use crate::domain::entities::site::site_key;
use crate::domain::entities::{DeployBundle, DeployStage, LiveRelease, Slot, StateDetail};
use crate::domain::errors::PipelineCause;
use crate::domain::remote::{
    CommandOutput, HostConfig, RemoteConnector, RemoteError, RemoteSession, shell_quote,
};

static DOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)+$")
        .expect("valid domain regex")
});

static PROXY_PASS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"proxy_pass\s+http://127\.0\.0\.1:(\d+)\s*;").expect("valid proxy_pass regex")
});

const EXTRACTED: &str = ".extracted";
const INSTALLED: &str = ".installed";
const BUILT: &str = ".built";

/// True for a plain DNS host name usable as an nginx `server_name`.
pub fn is_valid_domain(domain: &str) -> bool {
    domain.len() <= 253 && DOMAIN_REGEX.is_match(domain)
}

/// Reverse-proxy commands on the target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub conf_dir: String,
    pub test_command: String,
    pub reload_command: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            conf_dir: "/etc/nginx/conf.d".to_string(),
            test_command: "nginx -t".to_string(),
            reload_command: "nginx -s reload".to_string(),
        }
    }
}

/// Timeouts and limits for remote work.
#[derive(Debug, Clone)]
pub struct DeployerSettings {
    pub command_timeout: Duration,
    pub upload_timeout: Duration,
    pub upload_attempts: usize,
    /// Initial upload retry delay; doubles on each retry.
    pub upload_backoff: Duration,
    pub releases_to_keep: usize,
    pub health_checks: u32,
    pub proxy: ProxySettings,
}

impl Default for DeployerSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(300),
            upload_timeout: Duration::from_secs(120),
            upload_attempts: 3,
            upload_backoff: Duration::from_millis(500),
            releases_to_keep: 3,
            health_checks: 10,
            proxy: ProxySettings::default(),
        }
    }
}

/// What to deploy and where.
#[derive(Debug, Clone, Copy)]
pub struct DeployTarget<'a> {
    pub host: &'a HostConfig,
    pub domain: &'a str,
    pub bundle: &'a DeployBundle,
    /// Release serving traffic according to the ledger.
    pub previous: Option<&'a LiveRelease>,
}

/// The stage at which a deployment stopped and why.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: DeployStage,
    pub cause: PipelineCause,
}

impl StageFailure {
    pub(crate) fn new(stage: DeployStage, cause: impl Into<PipelineCause>) -> Self {
        Self {
            stage,
            cause: cause.into(),
        }
    }

    /// Captured output of the failing command, if any.
    pub fn command_output(&self) -> Option<String> {
        match &self.cause {
            PipelineCause::Remote(e) => e.output().map(str::to_string),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, PipelineCause::Remote(RemoteError::Cancelled))
    }
}

/// A release that went live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployed {
    pub live: LiveRelease,
    /// Cleanup problem after routing switched, kept on the record.
    pub notice: Option<String>,
}

/// Local port an nginx config written by [`server_block`] routes to.
fn routed_port(conf: &str) -> Option<u16> {
    PROXY_PASS_REGEX
        .captures(conf)
        .and_then(|caps| caps[1].parse().ok())
}

fn slot_for_port(app_port: u16, port: u16) -> Option<Slot> {
    [Slot::Blue, Slot::Green]
        .into_iter()
        .find(|slot| app_port.checked_add(slot.port_offset()) == Some(port))
}

/// Remote paths for one site and release.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Layout {
    releases: String,
    release: String,
    incoming: String,
    archive: String,
    current: String,
    proxy_conf: String,
}

impl Layout {
    fn new(host: &HostConfig, proxy: &ProxySettings, bundle: &DeployBundle) -> Self {
        let key = site_key(bundle.site_id);
        let site_root = format!("{}/{key}", host.remote_root.trim_end_matches('/'));
        let releases = format!("{site_root}/releases");
        let incoming = format!("{site_root}/incoming");
        Self {
            release: format!("{releases}/{}", bundle.release_name()),
            archive: format!("{incoming}/{}.tar.zst", bundle.digest),
            current: format!("{site_root}/current"),
            proxy_conf: format!("{}/{key}.conf", proxy.conf_dir.trim_end_matches('/')),
            releases,
            incoming,
        }
    }

    fn marker(&self, name: &str) -> String {
        format!("{}/{name}", self.release)
    }
}

/// Completed-stage markers found in an existing release directory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Markers {
    extracted: bool,
    installed: bool,
    built: bool,
}

impl Markers {
    fn parse(output: &str) -> Self {
        let found = |name: &str| output.lines().any(|line| line.trim() == name);
        let extracted = found(EXTRACTED);
        let installed = extracted && found(INSTALLED);
        Self {
            extracted,
            installed,
            built: installed && found(BUILT),
        }
    }
}

pub fn process_name(site_id: i64, slot: Slot) -> String {
    format!("{}-{}", site_key(site_id), slot.as_str())
}

/// nginx server block routing `domain` to the local port.
pub fn server_block(domain: &str, port: u16) -> String {
    format!(
        "# managed by site-pipeline\n\
         server {{\n\
         \x20   listen 80;\n\
         \x20   server_name {domain};\n\
         \n\
         \x20   location / {{\n\
         \x20       proxy_pass http://127.0.0.1:{port};\n\
         \x20       proxy_http_version 1.1;\n\
         \x20       proxy_set_header Host $host;\n\
         \x20       proxy_set_header X-Real-IP $remote_addr;\n\
         \x20       proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n\
         \x20       proxy_set_header X-Forwarded-Proto $scheme;\n\
         \x20   }}\n\
         }}\n"
    )
}

/// Drives one deployment over one SSH connection.
pub struct RemoteDeployer {
    connector: Arc<dyn RemoteConnector>,
    settings: DeployerSettings,
}

/// Per-attempt state shared by the stage functions.
struct Run<'a> {
    session: &'a dyn RemoteSession,
    handle: &'a AttemptHandle,
    ledger: &'a DeploymentLedger,
    target: DeployTarget<'a>,
    layout: Layout,
    settings: &'a DeployerSettings,
}

impl RemoteDeployer {
    pub fn new(connector: Arc<dyn RemoteConnector>, settings: DeployerSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &DeployerSettings {
        &self.settings
    }

    /// Runs every remote stage, recording each in the ledger.
    ///
    /// # Errors
    ///
    /// Returns the failing stage and its cause. A cancelled attempt fails
    /// with [`RemoteError::Cancelled`] at the stage it was stopped in.
    pub async fn deploy(
        &self,
        target: DeployTarget<'_>,
        handle: &AttemptHandle,
        ledger: &DeploymentLedger,
    ) -> Result<Deployed, StageFailure> {
        enter(handle, ledger, DeployStage::Connecting, StateDetail::default()).await?;

        let connect = self.connector.connect(target.host);
        let session = tokio::select! {
            biased;
            _ = handle.token().cancelled() => Err(RemoteError::Cancelled),
            result = connect => result,
        }
        .map_err(|e| StageFailure::new(DeployStage::Connecting, e))?;

        let run = Run {
            session: session.as_ref(),
            handle,
            ledger,
            target,
            layout: Layout::new(target.host, &self.settings.proxy, target.bundle),
            settings: &self.settings,
        };
        let result = run.execute().await;
        session.close().await;
        result
    }
}

/// Records entry into a stage unless the attempt was cancelled.
pub(crate) async fn enter(
    handle: &AttemptHandle,
    ledger: &DeploymentLedger,
    stage: DeployStage,
    detail: StateDetail,
) -> Result<(), StageFailure> {
    if handle.is_cancelled() {
        return Err(StageFailure::new(stage, RemoteError::Cancelled));
    }
    ledger
        .update(handle, stage, detail)
        .await
        .map(|_| ())
        .map_err(|e| StageFailure::new(stage, e))
}

impl Run<'_> {
    async fn execute(&self) -> Result<Deployed, StageFailure> {
        let bundle = self.target.bundle;
        let descriptor = &bundle.descriptor;

        self.enter(
            DeployStage::Uploading,
            StateDetail {
                remote_path: Some(self.layout.release.clone()),
                bundle_digest: Some(bundle.digest.clone()),
                ..StateDetail::default()
            },
        )
        .await?;
        let markers = self
            .upload()
            .await
            .map_err(|e| StageFailure::new(DeployStage::Uploading, e))?;

        self.enter(DeployStage::Extracting, StateDetail::default()).await?;
        if markers.extracted {
            tracing::info!(release = %self.layout.release, "Release already extracted");
        } else {
            self.extract()
                .await
                .map_err(|e| StageFailure::new(DeployStage::Extracting, e))?;
        }

        self.enter(DeployStage::Installing, StateDetail::default()).await?;
        if !markers.installed {
            self.in_release(&descriptor.install_command, INSTALLED)
                .await
                .map_err(|e| StageFailure::new(DeployStage::Installing, e))?;
        }

        self.enter(DeployStage::Building, StateDetail::default()).await?;
        if !markers.built {
            self.in_release(&descriptor.build_command, BUILT)
                .await
                .map_err(|e| StageFailure::new(DeployStage::Building, e))?;
        }

        self.enter(DeployStage::Supervising, StateDetail::default()).await?;
        let slot = self
            .live_slot()
            .await
            .map_err(|e| StageFailure::new(DeployStage::Supervising, e))?
            .map(|live| live.other())
            .unwrap_or(Slot::Blue);
        let port = self.target.host.app_port + slot.port_offset();
        let name = process_name(bundle.site_id, slot);

        if let Err(e) = self.supervise(&name, port).await {
            self.remove_process(&name).await;
            return Err(StageFailure::new(DeployStage::Supervising, e));
        }

        if !self.handle.commit_routing() {
            self.remove_process(&name).await;
            return Err(StageFailure::new(DeployStage::Supervising, RemoteError::Cancelled));
        }
        self.enter_committed(DeployStage::RoutingConfigured).await?;
        if let Err(e) = self.route(port).await {
            self.remove_process(&name).await;
            return Err(StageFailure::new(DeployStage::RoutingConfigured, e));
        }

        let notice = self.retire_previous(slot).await;
        self.prune_releases().await;

        Ok(Deployed {
            live: LiveRelease {
                slot,
                port,
                release_path: self.layout.release.clone(),
            },
            notice,
        })
    }

    /// Slot serving traffic now.
    ///
    /// The proxy config on the host is authoritative; the ledger is only
    /// consulted when the config is missing or routes elsewhere.
    async fn live_slot(&self) -> Result<Option<Slot>, RemoteError> {
        let conf = self
            .bounded(
                "read proxy config".to_string(),
                self.settings.command_timeout,
                self.session.read_file(&self.layout.proxy_conf),
            )
            .await?;
        let recorded = self.target.previous.map(|live| live.slot);
        let routed = conf
            .as_deref()
            .and_then(routed_port)
            .and_then(|port| slot_for_port(self.target.host.app_port, port));

        if let Some(routed) = routed
            && recorded != Some(routed)
        {
            tracing::warn!(
                site_id = self.handle.site_id,
                routed = routed.as_str(),
                recorded = recorded.map(|s| s.as_str()),
                "Proxy config disagrees with recorded live slot"
            );
        }
        Ok(routed.or(recorded))
    }

    async fn enter(&self, stage: DeployStage, detail: StateDetail) -> Result<(), StageFailure> {
        enter(self.handle, self.ledger, stage, detail).await
    }

    /// Records a stage after the routing commit, when cancel no longer applies.
    async fn enter_committed(&self, stage: DeployStage) -> Result<(), StageFailure> {
        self.ledger
            .update(self.handle, stage, StateDetail::default())
            .await
            .map(|_| ())
            .map_err(|e| StageFailure::new(stage, e))
    }

    /// Runs one command, bounded by the command timeout and the cancel token.
    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        self.bounded(
            operation_label(command),
            self.settings.command_timeout,
            self.session.exec(command),
        )
        .await
    }

    /// Runs a command and turns a non-zero exit into [`RemoteError::Command`].
    async fn exec_checked(&self, label: &str, command: &str) -> Result<CommandOutput, RemoteError> {
        let output = self.exec(command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(RemoteError::Command {
                command: label.to_string(),
                exit_code: output.exit_code,
                output: output.combined(),
            })
        }
    }

    /// Runs a command after the routing commit: bounded by time only.
    async fn exec_committed(&self, label: &str, command: &str) -> Result<CommandOutput, RemoteError> {
        let output = tokio::time::timeout(self.settings.command_timeout, self.session.exec(command))
            .await
            .map_err(|_| RemoteError::Timeout {
                operation: label.to_string(),
                after: self.settings.command_timeout,
            })??;
        if output.success() {
            Ok(output)
        } else {
            Err(RemoteError::Command {
                command: label.to_string(),
                exit_code: output.exit_code,
                output: output.combined(),
            })
        }
    }

    async fn bounded<T>(
        &self,
        operation: String,
        after: Duration,
        work: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        tokio::select! {
            biased;
            _ = self.handle.token().cancelled() => Err(RemoteError::Cancelled),
            result = tokio::time::timeout(after, work) => match result {
                Ok(inner) => inner,
                Err(_) => Err(RemoteError::Timeout { operation, after }),
            },
        }
    }

    /// Uploads the bundle unless the release was already extracted.
    ///
    /// Transfer failures and timeouts are retried with exponential backoff.
    async fn upload(&self) -> Result<Markers, RemoteError> {
        let layout = &self.layout;
        self.exec_checked(
            "prepare release directories",
            &format!(
                "mkdir -p {} {}",
                shell_quote(&layout.releases),
                shell_quote(&layout.incoming)
            ),
        )
        .await?;

        let probe = self
            .exec(&format!(
                "for m in {EXTRACTED} {INSTALLED} {BUILT}; do [ -f {}/$m ] && echo $m; done; true",
                shell_quote(&layout.release)
            ))
            .await?;
        let markers = Markers::parse(&probe.stdout);
        if markers.extracted {
            return Ok(markers);
        }

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.settings.upload_backoff.as_millis() as u64 / 2)
            .take(self.settings.upload_attempts.saturating_sub(1));
        let local: &Path = &self.target.bundle.path;
        let remote = layout.archive.as_str();

        RetryIf::spawn(
            strategy,
            move || async move {
                let result = self
                    .bounded(
                        "upload".to_string(),
                        self.settings.upload_timeout,
                        self.session.upload(local, remote),
                    )
                    .await;
                if let Err(e) = &result {
                    tracing::warn!(site_id = self.handle.site_id, error = %e, "Upload attempt failed");
                }
                result
            },
            |e: &RemoteError| e.is_transient(),
        )
        .await?;

        Ok(markers)
    }

    async fn extract(&self) -> Result<(), RemoteError> {
        let release = shell_quote(&self.layout.release);
        let archive = shell_quote(&self.layout.archive);
        self.exec_checked(
            "tar --zstd -xf",
            &format!(
                "rm -rf {release} && mkdir -p {release} && tar --zstd -xf {archive} -C {release} && rm -f {archive} && touch {}",
                shell_quote(&self.layout.marker(EXTRACTED))
            ),
        )
        .await
        .map(|_| ())
    }

    /// Runs a descriptor command inside the release and sets its marker.
    async fn in_release(&self, command: &str, marker: &str) -> Result<(), RemoteError> {
        self.exec_checked(
            command,
            &format!(
                "cd {} && {command} && touch {marker}",
                shell_quote(&self.layout.release)
            ),
        )
        .await
        .map(|_| ())
    }

    /// Starts the release on the idle slot and waits until it answers.
    async fn supervise(&self, name: &str, port: u16) -> Result<(), RemoteError> {
        let quoted = shell_quote(name);
        self.exec(&format!("pm2 delete {quoted} >/dev/null 2>&1; true"))
            .await?;

        let start = &self.target.bundle.descriptor.start_command;
        self.exec_checked(
            "pm2 start",
            &format!(
                "cd {} && PORT={port} pm2 start {} --name {quoted} --time --update-env",
                shell_quote(&self.layout.release),
                shell_quote(start)
            ),
        )
        .await?;

        let checks = self.settings.health_checks.max(1);
        let probe = format!(
            "for i in $(seq 1 {checks}); do curl -fsS -o /dev/null http://127.0.0.1:{port}/ && exit 0; sleep 1; done; \
             pm2 logs {quoted} --lines 40 --nostream; exit 1"
        );
        self.exec_checked("health check", &probe).await.map(|_| ())
    }

    /// Writes the proxy config: backup, write, test, reload. A failed test or
    /// reload restores the backup.
    async fn route(&self, port: u16) -> Result<(), RemoteError> {
        let conf = shell_quote(&self.layout.proxy_conf);
        let backup = shell_quote(&format!("{}.bak", self.layout.proxy_conf));
        let proxy = &self.settings.proxy;

        self.exec_committed(
            "backup proxy config",
            &format!("if [ -f {conf} ]; then cp -p {conf} {backup}; else rm -f {backup}; fi"),
        )
        .await?;

        let contents = server_block(self.target.domain, port);
        tokio::time::timeout(
            self.settings.command_timeout,
            self.session.write_file(&self.layout.proxy_conf, &contents),
        )
        .await
        .map_err(|_| RemoteError::Timeout {
            operation: "write proxy config".to_string(),
            after: self.settings.command_timeout,
        })??;

        let applied = match self.exec_committed(&proxy.test_command, &proxy.test_command).await {
            Ok(_) => {
                self.exec_committed(&proxy.reload_command, &proxy.reload_command)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = applied {
            tracing::warn!(site_id = self.handle.site_id, error = %e, "Proxy config rejected; restoring backup");
            let restore = format!(
                "if [ -f {backup} ]; then mv -f {backup} {conf}; else rm -f {conf}; fi && {}",
                proxy.reload_command
            );
            if let Err(restore_err) = self.exec_committed("restore proxy config", &restore).await {
                tracing::error!(site_id = self.handle.site_id, error = %restore_err, "Failed to restore proxy config");
            }
            return Err(e);
        }

        let current = format!(
            "ln -sfn {} {}",
            shell_quote(&self.layout.release),
            shell_quote(&self.layout.current)
        );
        if let Err(e) = self.exec_committed("update current link", &current).await {
            tracing::warn!(site_id = self.handle.site_id, error = %e, "Failed to update current link");
        }
        Ok(())
    }

    /// Stops the process on the slot that served traffic before this release.
    ///
    /// Returns a notice for the record when the old process may still run.
    async fn retire_previous(&self, new_slot: Slot) -> Option<String> {
        let old = process_name(self.target.bundle.site_id, new_slot.other());
        let command = format!(
            "pm2 delete {} >/dev/null 2>&1; pm2 save >/dev/null 2>&1; true",
            shell_quote(&old)
        );
        match self.exec_committed("retire previous slot", &command).await {
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(site_id = self.handle.site_id, process = %old, error = %e, "Failed to stop previous slot");
                let mut notice = format!("previous slot `{old}` may still be running: {e}");
                if let Some(output) = e.output().filter(|o| !o.is_empty()) {
                    notice.push('\n');
                    notice.push_str(output);
                }
                Some(notice)
            }
        }
    }

    /// Keeps the newest releases, never deleting the one just deployed.
    async fn prune_releases(&self) {
        let keep = self.settings.releases_to_keep.max(1);
        let release_name = self.target.bundle.release_name();
        let command = format!(
            "cd {} && ls -1t | grep -v -x {} | tail -n +{keep} | xargs -r rm -rf; true",
            shell_quote(&self.layout.releases),
            shell_quote(release_name)
        );
        if let Err(e) = self.exec_committed("prune releases", &command).await {
            tracing::warn!(site_id = self.handle.site_id, error = %e, "Failed to prune releases");
        }
    }

    async fn remove_process(&self, name: &str) {
        let command = format!("pm2 delete {} >/dev/null 2>&1; true", shell_quote(name));
        if let Err(e) = self.exec_committed("remove new process", &command).await {
            tracing::warn!(site_id = self.handle.site_id, process = %name, error = %e, "Failed to remove new process");
        }
    }
}

/// First word of a command, used to name timeouts.
fn operation_label(command: &str) -> String {
    command
        .split_whitespace()
        .next()
        .unwrap_or("command")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{DeployDescriptor, DeploymentRecord, PipelineState};
    use crate::domain::remote::{HostAuth, MockRemoteConnector};
    use crate::domain::repositories::MockDeploymentRepository;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Session that answers commands by substring and records everything.
    #[derive(Default)]
    struct ScriptedSession {
        log: Arc<Mutex<Vec<String>>>,
        failures: Vec<(&'static str, CommandOutput)>,
        marker_output: String,
        transfer_failures: Mutex<u32>,
        /// Proxy config already on the host.
        proxy_conf: Option<String>,
    }

    #[async_trait]
    impl RemoteSession for ScriptedSession {
        async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError> {
            self.log.lock().unwrap().push(command.to_string());
            if command.starts_with("for m in") {
                return Ok(CommandOutput {
                    exit_code: Some(0),
                    stdout: self.marker_output.clone(),
                    stderr: String::new(),
                });
            }
            for (needle, output) in &self.failures {
                if command.contains(needle) {
                    return Ok(output.clone());
                }
            }
            Ok(CommandOutput {
                exit_code: Some(0),
                ..CommandOutput::default()
            })
        }

        async fn upload(&self, _local: &Path, remote_path: &str) -> Result<(), RemoteError> {
            self.log.lock().unwrap().push(format!("upload {remote_path}"));
            let mut failures = self.transfer_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(RemoteError::Transfer("connection reset".to_string()));
            }
            Ok(())
        }

        async fn write_file(&self, remote_path: &str, _contents: &str) -> Result<(), RemoteError> {
            self.log.lock().unwrap().push(format!("write {remote_path}"));
            Ok(())
        }

        async fn read_file(&self, remote_path: &str) -> Result<Option<String>, RemoteError> {
            self.log.lock().unwrap().push(format!("read {remote_path}"));
            Ok(self.proxy_conf.clone())
        }

        async fn close(&self) {}
    }

    fn failing(code: i32, text: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: text.to_string(),
        }
    }

    fn host() -> HostConfig {
        HostConfig {
            address: "203.0.113.10".to_string(),
            port: 22,
            user: "deploy".to_string(),
            auth: HostAuth::Agent,
            remote_root: "/srv/sites".to_string(),
            app_port: 4000,
        }
    }

    fn bundle() -> DeployBundle {
        DeployBundle {
            site_id: 5,
            path: "/tmp/bundle.tar.zst".into(),
            digest: "ab".repeat(32),
            size: 10,
            descriptor: DeployDescriptor {
                runtime_version: "20".to_string(),
                install_command: "npm install".to_string(),
                build_command: "npm run build".to_string(),
                start_command: "npm start".to_string(),
                built_at: Utc::now(),
            },
        }
    }

    fn ledger() -> DeploymentLedger {
        let mut repo = MockDeploymentRepository::new();
        repo.expect_try_begin().returning(|site_id, attempt_id, domain, _| {
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
        repo.expect_transition()
            .returning(|site_id, attempt_id, state, stage, _| {
                let now = Utc::now();
                Ok(DeploymentRecord {
                    site_id,
                    attempt_id,
                    state,
                    stage,
                    domain: "cafe.example.test".to_string(),
                    remote_path: None,
                    bundle_digest: None,
                    last_error: None,
                    command_output: None,
                    live: None,
                    started_at: now,
                    updated_at: now,
                    finished_at: None,
                })
            });
        DeploymentLedger::new(Arc::new(repo), chrono::Duration::minutes(30))
    }

    fn deployer(session: ScriptedSession) -> RemoteDeployer {
        let session = Arc::new(session);
        let mut connector = MockRemoteConnector::new();
        connector.expect_connect().returning(move |_| {
            let session = Arc::clone(&session);
            Ok(Box::new(SharedSession(session)) as Box<dyn RemoteSession>)
        });
        RemoteDeployer::new(
            Arc::new(connector),
            DeployerSettings {
                upload_backoff: Duration::from_millis(2),
                health_checks: 1,
                ..DeployerSettings::default()
            },
        )
    }

    struct SharedSession(Arc<ScriptedSession>);

    #[async_trait]
    impl RemoteSession for SharedSession {
        async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError> {
            self.0.exec(command).await
        }
        async fn upload(&self, local: &Path, remote_path: &str) -> Result<(), RemoteError> {
            self.0.upload(local, remote_path).await
        }
        async fn write_file(&self, remote_path: &str, contents: &str) -> Result<(), RemoteError> {
            self.0.write_file(remote_path, contents).await
        }
        async fn read_file(&self, remote_path: &str) -> Result<Option<String>, RemoteError> {
            self.0.read_file(remote_path).await
        }
        async fn close(&self) {}
    }

    async fn run(session: ScriptedSession, previous: Option<LiveRelease>) -> (Result<Deployed, StageFailure>, Vec<String>) {
        let log = Arc::clone(&session.log);
        let deployer = deployer(session);
        let ledger = ledger();
        let (_, handle) = ledger.begin(5, "cafe.example.test").await.unwrap();
        let host = host();
        let bundle = bundle();
        let target = DeployTarget {
            host: &host,
            domain: "cafe.example.test",
            bundle: &bundle,
            previous: previous.as_ref(),
        };
        let result = deployer.deploy(target, &handle, &ledger).await;
        let log = log.lock().unwrap().clone();
        (result, log)
    }

    #[tokio::test]
    async fn test_happy_path_goes_live_on_blue() {
        let (result, log) = run(ScriptedSession::default(), None).await;

        let live = result.unwrap().live;
        assert_eq!(live.slot, Slot::Blue);
        assert_eq!(live.port, 4000);
        assert!(live.release_path.ends_with(&"ab".repeat(8)));
        assert!(log.iter().any(|c| c.contains("tar --zstd -xf")));
        assert!(log.iter().any(|c| c == "write /etc/nginx/conf.d/site-5.conf"));
        assert!(log.iter().any(|c| c.contains("pm2 delete site-5-green")));
    }

    #[tokio::test]
    async fn test_alternates_slot_from_previous_release() {
        let previous = LiveRelease {
            slot: Slot::Blue,
            port: 4000,
            release_path: "/srv/sites/site-5/releases/old".to_string(),
        };
        let (result, log) = run(ScriptedSession::default(), Some(previous)).await;

        let live = result.unwrap().live;
        assert_eq!(live.slot, Slot::Green);
        assert_eq!(live.port, 4001);
        assert!(log.iter().any(|c| c.contains("pm2 delete site-5-blue")));
    }

    #[tokio::test]
    async fn test_routed_slot_on_host_wins_over_missing_record() {
        let session = ScriptedSession {
            proxy_conf: Some(server_block("cafe.example.test", 4000)),
            failures: vec![("curl -fsS", failing(1, "connection refused"))],
            ..ScriptedSession::default()
        };
        let (result, log) = run(session, None).await;

        assert_eq!(result.unwrap_err().stage, DeployStage::Supervising);
        assert!(log.iter().any(|c| c.contains("pm2 start") && c.contains("PORT=4001")));
        assert!(!log.iter().any(|c| c.contains("site-5-blue")));
        assert!(!log.iter().any(|c| c.starts_with("write ")));
    }

    #[tokio::test]
    async fn test_routed_slot_on_host_wins_over_stale_record() {
        let recorded = LiveRelease {
            slot: Slot::Blue,
            port: 4000,
            release_path: "/srv/sites/site-5/releases/old".to_string(),
        };
        let session = ScriptedSession {
            proxy_conf: Some(server_block("cafe.example.test", 4001)),
            ..ScriptedSession::default()
        };
        let (result, log) = run(session, Some(recorded)).await;

        let live = result.unwrap().live;
        assert_eq!(live.slot, Slot::Blue);
        assert_eq!(live.port, 4000);
        assert!(log.iter().any(|c| c.contains("pm2 start") && c.contains("PORT=4000")));
        assert!(log.iter().any(|c| c.contains("pm2 delete site-5-green") && c.contains("pm2 save")));
    }

    #[tokio::test]
    async fn test_failed_retire_is_reported() {
        let session = ScriptedSession {
            failures: vec![("pm2 save", failing(1, "pm2 daemon not running"))],
            ..ScriptedSession::default()
        };
        let (result, _) = run(session, None).await;

        let deployed = result.unwrap();
        assert_eq!(deployed.live.slot, Slot::Blue);
        let notice = deployed.notice.expect("retire problem recorded");
        assert!(notice.contains("site-5-green"));
        assert!(notice.contains("pm2 daemon not running"));
    }

    #[tokio::test]
    async fn test_clean_retire_has_no_notice() {
        let (result, _) = run(ScriptedSession::default(), None).await;
        assert!(result.unwrap().notice.is_none());
    }

    #[tokio::test]
    async fn test_install_failure_never_touches_routing() {
        let session = ScriptedSession {
            failures: vec![("npm install", failing(1, "npm ERR! ENOTFOUND"))],
            ..ScriptedSession::default()
        };
        let (result, log) = run(session, None).await;

        let failure = result.unwrap_err();
        assert_eq!(failure.stage, DeployStage::Installing);
        assert_eq!(failure.command_output().as_deref(), Some("npm ERR! ENOTFOUND"));
        assert!(!log.iter().any(|c| c.contains("pm2")));
        assert!(!log.iter().any(|c| c.starts_with("write ")));
    }

    #[tokio::test]
    async fn test_build_failure_captures_output() {
        let session = ScriptedSession {
            failures: vec![("npm run build", failing(2, "Missing script: build"))],
            ..ScriptedSession::default()
        };
        let (result, _) = run(session, None).await;

        let failure = result.unwrap_err();
        assert_eq!(failure.stage, DeployStage::Building);
        assert_eq!(failure.command_output().as_deref(), Some("Missing script: build"));
    }

    #[tokio::test]
    async fn test_failed_health_check_removes_new_process() {
        let session = ScriptedSession {
            failures: vec![("curl -fsS", failing(1, "connection refused"))],
            ..ScriptedSession::default()
        };
        let (result, log) = run(session, None).await;

        assert_eq!(result.unwrap_err().stage, DeployStage::Supervising);
        assert_eq!(
            log.iter().filter(|c| c.contains("pm2 delete site-5-blue")).count(),
            2
        );
        assert!(!log.iter().any(|c| c.starts_with("write ")));
    }

    #[tokio::test]
    async fn test_rejected_proxy_config_restores_backup() {
        let session = ScriptedSession {
            failures: vec![("nginx -t", failing(1, "unknown directive"))],
            ..ScriptedSession::default()
        };
        let (result, log) = run(session, None).await;

        assert_eq!(result.unwrap_err().stage, DeployStage::RoutingConfigured);
        assert!(log.iter().any(|c| c.contains("mv -f /etc/nginx/conf.d/site-5.conf.bak")));
        assert!(!log.iter().any(|c| c.starts_with("ln -sfn")));
    }

    #[tokio::test]
    async fn test_transient_upload_failure_is_retried() {
        let session = ScriptedSession {
            transfer_failures: Mutex::new(2),
            ..ScriptedSession::default()
        };
        let (result, log) = run(session, None).await;

        assert!(result.is_ok());
        assert_eq!(log.iter().filter(|c| c.starts_with("upload ")).count(), 3);
    }

    #[tokio::test]
    async fn test_upload_gives_up_after_attempt_ceiling() {
        let session = ScriptedSession {
            transfer_failures: Mutex::new(5),
            ..ScriptedSession::default()
        };
        let (result, log) = run(session, None).await;

        let failure = result.unwrap_err();
        assert_eq!(failure.stage, DeployStage::Uploading);
        assert_eq!(log.iter().filter(|c| c.starts_with("upload ")).count(), 3);
    }

    #[tokio::test]
    async fn test_completed_stages_are_skipped() {
        let session = ScriptedSession {
            marker_output: ".extracted\n.installed\n.built\n".to_string(),
            ..ScriptedSession::default()
        };
        let (result, log) = run(session, None).await;

        assert!(result.is_ok());
        assert!(!log.iter().any(|c| c.starts_with("upload ")));
        assert!(!log.iter().any(|c| c.contains("npm install")));
        assert!(!log.iter().any(|c| c.contains("npm run build")));
    }

    #[tokio::test]
    async fn test_cancel_before_connect() {
        let deployer = deployer(ScriptedSession::default());
        let ledger = ledger();
        let (_, handle) = ledger.begin(5, "cafe.example.test").await.unwrap();
        let host = host();
        let bundle = bundle();
        handle.request_cancel().unwrap();

        let target = DeployTarget {
            host: &host,
            domain: "cafe.example.test",
            bundle: &bundle,
            previous: None,
        };
        let failure = deployer.deploy(target, &handle, &ledger).await.unwrap_err();
        assert_eq!(failure.stage, DeployStage::Connecting);
        assert!(failure.is_cancelled());
    }

    #[test]
    fn test_markers_require_predecessors() {
        assert_eq!(
            Markers::parse(".installed\n.built\n"),
            Markers::default()
        );
        let m = Markers::parse(".extracted\n.built\n");
        assert!(m.extracted && !m.installed && !m.built);
    }

    #[test]
    fn test_domain_validation() {
        assert!(is_valid_domain("cafe.example.test"));
        assert!(is_valid_domain("xn--caf-dma.example"));
        assert!(!is_valid_domain("localhost"));
        assert!(!is_valid_domain("bad domain.test"));
        assert!(!is_valid_domain("evil.test; include /etc/passwd"));
        assert!(!is_valid_domain("-lead.test"));
    }

    #[test]
    fn test_routed_port_reads_written_block() {
        assert_eq!(routed_port(&server_block("cafe.example.test", 4101)), Some(4101));
        assert_eq!(routed_port("server { listen 80; root /var/www; }"), None);
    }

    #[test]
    fn test_slot_for_port() {
        assert_eq!(slot_for_port(4100, 4100), Some(Slot::Blue));
        assert_eq!(slot_for_port(4100, 4101), Some(Slot::Green));
        assert_eq!(slot_for_port(4100, 8080), None);
        assert_eq!(slot_for_port(u16::MAX, 0), None);
    }

    #[test]
    fn test_server_block_routes_port() {
        let block = server_block("cafe.example.test", 4001);
        assert!(block.contains("server_name cafe.example.test;"));
        assert!(block.contains("proxy_pass http://127.0.0.1:4001;"));
    }

    #[test]
    fn test_layout_paths() {
        let layout = Layout::new(&host(), &ProxySettings::default(), &bundle());
        assert_eq!(layout.archive, format!("/srv/sites/site-5/incoming/{}.tar.zst", "ab".repeat(32)));
        assert_eq!(layout.release, format!("/srv/sites/site-5/releases/{}", "ab".repeat(8)));
        assert_eq!(layout.current, "/srv/sites/site-5/current");
    }
}
