//! Persistence for deployment records.

use crate::domain::entities::{
    DeployStage, DeploymentAttempt, DeploymentRecord, LiveRelease, PipelineState, StateDetail,
};
use crate::error::AppError;
use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

/// Repository interface backing the deployment ledger.
///
/// Every write after [`DeploymentRepository::try_begin`] is scoped to an
/// `attempt_id`, so a stale attempt can never overwrite a newer one.
///
/// # Implementations
///
/// - [`crate::infrastructure::persistence::PgDeploymentRepository`] - PostgreSQL implementation
/// - Test mocks available with `cfg(test)`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    /// Returns the current record for a site.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Internal`] on database errors.
    async fn find(&self, site_id: i64) -> Result<Option<DeploymentRecord>, AppError>;

    /// Atomically reserves the site for a new attempt.
    ///
    /// Succeeds when the site has no record, a terminal record, or an
    /// in-flight record not updated for `stale_after`. The live release of
    /// an earlier attempt is preserved.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(record))` with state `queued` when the reservation was taken
    /// - `Ok(None)` when another attempt is in flight
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Internal`] on database errors.
    async fn try_begin(
        &self,
        site_id: i64,
        attempt_id: Uuid,
        domain: &str,
        stale_after: Duration,
    ) -> Result<Option<DeploymentRecord>, AppError>;

    /// Writes a state transition for the given attempt.
    ///
    /// `None` fields in `detail` keep their stored value.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Conflict`] if `attempt_id` no longer owns the record.
    /// Returns [`AppError::Internal`] on database errors.
    async fn transition(
        &self,
        site_id: i64,
        attempt_id: Uuid,
        state: PipelineState,
        stage: Option<DeployStage>,
        detail: StateDetail,
    ) -> Result<DeploymentRecord, AppError>;

    /// Marks the attempt live and records the release now receiving traffic.
    ///
    /// `notice` is stored as the record's command output; it carries cleanup
    /// problems that did not stop the release.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Conflict`] if `attempt_id` no longer owns the record.
    /// Returns [`AppError::Internal`] on database errors.
    async fn mark_live(
        &self,
        site_id: i64,
        attempt_id: Uuid,
        live: LiveRelease,
        notice: Option<String>,
    ) -> Result<DeploymentRecord, AppError>;

    /// Appends a finished attempt to the history table.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Internal`] on database errors.
    async fn record_attempt(&self, record: DeploymentRecord) -> Result<(), AppError>;

    /// Lists finished attempts, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Internal`] on database errors.
    async fn history(&self, site_id: i64, limit: i64)
    -> Result<Vec<DeploymentAttempt>, AppError>;
}
