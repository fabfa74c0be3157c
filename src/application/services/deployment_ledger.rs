//! Deployment Ledger: persisted per-site pipeline state and in-flight handles.

use chrono::Duration;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::entities::{
    DeployStage, DeploymentAttempt, DeploymentRecord, LiveRelease, PipelineState, StateDetail,
};
use crate::domain::errors::LedgerError;
use crate::domain::repositories::DeploymentRepository;
use crate::error::AppError;

const RUNNING: u8 = 0;
const COMMITTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Retries of the live write after routing switched: 100 ms, then 200 ms.
const LIVE_WRITE_RETRIES: usize = 2;
const LIVE_WRITE_BACKOFF_MS: u64 = 100;

/// Handle to one in-flight attempt.
///
/// Cancellation and the routing commit race on a single atomic: whichever
/// lands first wins, so a cancel can never interrupt a routing switch.
#[derive(Debug)]
pub struct AttemptHandle {
    pub site_id: i64,
    pub attempt_id: Uuid,
    token: CancellationToken,
    phase: AtomicU8,
}

impl AttemptHandle {
    pub fn new(site_id: i64, attempt_id: Uuid) -> Self {
        Self {
            site_id,
            attempt_id,
            token: CancellationToken::new(),
            phase: AtomicU8::new(RUNNING),
        }
    }

    /// Token raced against running remote commands.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once a cancel was accepted or a newer attempt took over.
    pub fn is_cancelled(&self) -> bool {
        self.phase.load(Ordering::Acquire) == CANCELLED || self.token.is_cancelled()
    }

    /// Marks the point of no return before routing changes.
    ///
    /// Returns `false` if the attempt was cancelled first.
    pub fn commit_routing(&self) -> bool {
        match self
            .phase
            .compare_exchange(RUNNING, COMMITTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == COMMITTED,
        }
    }

    pub(crate) fn request_cancel(&self) -> Result<(), LedgerError> {
        match self
            .phase
            .compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(CANCELLED) => {
                self.token.cancel();
                Ok(())
            }
            Err(_) => Err(LedgerError::CancelTooLate {
                site_id: self.site_id,
            }),
        }
    }
}

/// Persisted pipeline state per site, allowing one in-flight attempt each.
pub struct DeploymentLedger {
    repository: Arc<dyn DeploymentRepository>,
    handles: DashMap<i64, Arc<AttemptHandle>>,
    stale_after: Duration,
}

impl DeploymentLedger {
    pub fn new(repository: Arc<dyn DeploymentRepository>, stale_after: Duration) -> Self {
        Self {
            repository,
            handles: DashMap::new(),
            stale_after,
        }
    }

    /// Reserves the site for a new attempt.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::DeployInProgress`] if another attempt holds the site
    /// - [`LedgerError::Store`] on storage failure
    pub async fn begin(
        &self,
        site_id: i64,
        domain: &str,
    ) -> Result<(DeploymentRecord, Arc<AttemptHandle>), LedgerError> {
        let attempt_id = Uuid::new_v4();
        let record = self
            .repository
            .try_begin(site_id, attempt_id, domain, self.stale_after)
            .await
            .map_err(store_error)?
            .ok_or(LedgerError::DeployInProgress { site_id })?;

        let handle = Arc::new(AttemptHandle::new(site_id, attempt_id));
        if let Some(previous) = self.handles.insert(site_id, Arc::clone(&handle)) {
            tracing::warn!(
                site_id,
                stale_attempt = %previous.attempt_id,
                "Took over stale deployment"
            );
            previous.token.cancel();
        }

        tracing::info!(site_id, attempt = %attempt_id, domain, "Deployment reserved");
        Ok((record, handle))
    }

    /// Records the stage an attempt has entered.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on storage failure.
    pub async fn update(
        &self,
        handle: &AttemptHandle,
        stage: DeployStage,
        detail: StateDetail,
    ) -> Result<DeploymentRecord, LedgerError> {
        tracing::info!(
            site_id = handle.site_id,
            stage = %stage,
            attempt = %handle.attempt_id,
            "Stage started"
        );
        self.repository
            .transition(
                handle.site_id,
                handle.attempt_id,
                stage.pipeline_state(),
                Some(stage),
                detail,
            )
            .await
            .map_err(store_error)
    }

    /// Ends an attempt in `Error(stage)`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on storage failure.
    pub async fn fail(
        &self,
        handle: &AttemptHandle,
        stage: DeployStage,
        message: String,
        command_output: Option<String>,
    ) -> Result<DeploymentRecord, LedgerError> {
        tracing::warn!(
            site_id = handle.site_id,
            stage = %stage,
            attempt = %handle.attempt_id,
            error = %message,
            "Deployment failed"
        );
        let detail = StateDetail {
            last_error: Some(message),
            command_output,
            ..StateDetail::default()
        };
        self.finish(handle, PipelineState::Error, Some(stage), detail)
            .await
    }

    /// Ends an attempt that stopped on a cancel request.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on storage failure.
    pub async fn cancelled(
        &self,
        handle: &AttemptHandle,
        stage: DeployStage,
    ) -> Result<DeploymentRecord, LedgerError> {
        tracing::info!(
            site_id = handle.site_id,
            stage = %stage,
            attempt = %handle.attempt_id,
            "Deployment cancelled"
        );
        let detail = StateDetail {
            last_error: Some(format!("cancelled during {stage}")),
            ..StateDetail::default()
        };
        self.finish(handle, PipelineState::Cancelled, Some(stage), detail)
            .await
    }

    /// Marks an attempt live with the release now serving traffic.
    ///
    /// Routing has already switched when this is called, so a failed write is
    /// retried. If it still fails the attempt is closed as `Error` at
    /// `RoutingConfigured` with the routed slot in its message, which frees
    /// the site for the next deploy.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] when the live release could not be
    /// recorded.
    pub async fn go_live(
        &self,
        handle: &AttemptHandle,
        live: LiveRelease,
        notice: Option<String>,
    ) -> Result<DeploymentRecord, LedgerError> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(LIVE_WRITE_BACKOFF_MS / 2)
            .take(LIVE_WRITE_RETRIES);
        let result = RetryIf::spawn(
            strategy,
            || {
                self.repository.mark_live(
                    handle.site_id,
                    handle.attempt_id,
                    live.clone(),
                    notice.clone(),
                )
            },
            |e: &AppError| !matches!(e, AppError::Conflict { .. }),
        )
        .await
        .map_err(store_error);

        let record = match result {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    site_id = handle.site_id,
                    attempt = %handle.attempt_id,
                    slot = live.slot.as_str(),
                    port = live.port,
                    error = %e,
                    "Failed to record live release"
                );
                let detail = StateDetail {
                    last_error: Some(format!(
                        "routing switched to the {} slot on port {} but the live release was not recorded: {e}",
                        live.slot.as_str(),
                        live.port
                    )),
                    command_output: notice,
                    ..StateDetail::default()
                };
                if let Err(close) = self
                    .finish(handle, PipelineState::Error, Some(DeployStage::RoutingConfigured), detail)
                    .await
                {
                    tracing::error!(site_id = handle.site_id, error = %close, "Failed to close deployment");
                }
                return Err(e);
            }
        };
        self.release(handle);

        tracing::info!(
            site_id = handle.site_id,
            stage = %DeployStage::Live,
            attempt = %handle.attempt_id,
            "Deployment live"
        );
        self.archive(&record).await;
        Ok(record)
    }

    /// Requests cancellation of the site's in-flight attempt.
    ///
    /// The attempt stops at its next stage boundary or as soon as its running
    /// command is killed; the returned record may still show it in flight.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NothingInFlight`] if no attempt is running here
    /// - [`LedgerError::CancelTooLate`] once routing has been committed
    /// - [`LedgerError::Store`] on storage failure
    pub async fn cancel(&self, site_id: i64) -> Result<DeploymentRecord, LedgerError> {
        let handle = self
            .handles
            .get(&site_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(LedgerError::NothingInFlight { site_id })?;

        handle.request_cancel()?;
        tracing::info!(site_id, attempt = %handle.attempt_id, "Cancellation requested");

        self.get(site_id)
            .await?
            .ok_or(LedgerError::NothingInFlight { site_id })
    }

    /// Current record for a site.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on storage failure.
    pub async fn get(&self, site_id: i64) -> Result<Option<DeploymentRecord>, LedgerError> {
        self.repository.find(site_id).await.map_err(store_error)
    }

    /// Finished attempts, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on storage failure.
    pub async fn history(
        &self,
        site_id: i64,
        limit: i64,
    ) -> Result<Vec<DeploymentAttempt>, LedgerError> {
        self.repository
            .history(site_id, limit)
            .await
            .map_err(store_error)
    }

    /// True if this process is running an attempt for the site.
    pub fn is_in_flight(&self, site_id: i64) -> bool {
        self.handles.contains_key(&site_id)
    }

    async fn finish(
        &self,
        handle: &AttemptHandle,
        state: PipelineState,
        stage: Option<DeployStage>,
        detail: StateDetail,
    ) -> Result<DeploymentRecord, LedgerError> {
        let result = self
            .repository
            .transition(handle.site_id, handle.attempt_id, state, stage, detail)
            .await
            .map_err(store_error);
        self.release(handle);

        let record = result?;
        self.archive(&record).await;
        Ok(record)
    }

    fn release(&self, handle: &AttemptHandle) {
        self.handles
            .remove_if(&handle.site_id, |_, h| h.attempt_id == handle.attempt_id);
    }

    async fn archive(&self, record: &DeploymentRecord) {
        if let Err(e) = self.repository.record_attempt(record.clone()).await {
            tracing::warn!(site_id = record.site_id, error = %e, "Failed to archive attempt");
        }
    }
}

fn store_error(e: AppError) -> LedgerError {
    LedgerError::Store(e.to_string())
}
