//! PostgreSQL implementation of the deployment ledger storage.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::entities::{
    DeployStage, DeploymentAttempt, DeploymentRecord, LiveRelease, PipelineState, Slot,
    StateDetail,
};
use crate::domain::repositories::DeploymentRepository;
use crate::error::AppError;

/// Stores one current row per site in `deployments` and finished attempts in
/// `deployment_attempts`. Every state write also mirrors the coarse state into
/// `sites.deploy_status` within the same transaction.
pub struct PgDeploymentRepository {
    pool: Arc<PgPool>,
}

impl PgDeploymentRepository {
    /// Creates a new repository with a database connection pool.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

const RECORD_COLUMNS: &str = "site_id, attempt_id, state, stage, domain, remote_path, \
     bundle_digest, last_error, command_output, live_slot, live_port, live_release, \
     started_at, updated_at, finished_at";

#[derive(FromRow)]
struct DeploymentRow {
    site_id: i64,
    attempt_id: Uuid,
    state: String,
    stage: Option<String>,
    domain: String,
    remote_path: Option<String>,
    bundle_digest: Option<String>,
    last_error: Option<String>,
    command_output: Option<String>,
    live_slot: Option<String>,
    live_port: Option<i32>,
    live_release: Option<String>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeploymentRow> for DeploymentRecord {
    type Error = AppError;

    fn try_from(r: DeploymentRow) -> Result<Self, Self::Error> {
        let live = match (r.live_slot, r.live_port, r.live_release) {
            (Some(slot), Some(port), Some(release_path)) => Some(LiveRelease {
                slot: Slot::from_str(&slot).map_err(corrupt)?,
                port: u16::try_from(port).map_err(|e| corrupt(e.to_string()))?,
                release_path,
            }),
            _ => None,
        };

        Ok(DeploymentRecord {
            site_id: r.site_id,
            attempt_id: r.attempt_id,
            state: PipelineState::from_str(&r.state).map_err(corrupt)?,
            stage: r
                .stage
                .as_deref()
                .map(DeployStage::from_str)
                .transpose()
                .map_err(corrupt)?,
            domain: r.domain,
            remote_path: r.remote_path,
            bundle_digest: r.bundle_digest,
            last_error: r.last_error,
            command_output: r.command_output,
            live,
            started_at: r.started_at,
            updated_at: r.updated_at,
            finished_at: r.finished_at,
        })
    }
}

#[derive(FromRow)]
struct AttemptRow {
    attempt_id: Uuid,
    site_id: i64,
    state: String,
    stage: Option<String>,
    domain: String,
    remote_path: Option<String>,
    bundle_digest: Option<String>,
    last_error: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl TryFrom<AttemptRow> for DeploymentAttempt {
    type Error = AppError;

    fn try_from(r: AttemptRow) -> Result<Self, Self::Error> {
        Ok(DeploymentAttempt {
            attempt_id: r.attempt_id,
            site_id: r.site_id,
            state: PipelineState::from_str(&r.state).map_err(corrupt)?,
            stage: r
                .stage
                .as_deref()
                .map(DeployStage::from_str)
                .transpose()
                .map_err(corrupt)?,
            domain: r.domain,
            remote_path: r.remote_path,
            bundle_digest: r.bundle_digest,
            last_error: r.last_error,
            started_at: r.started_at,
            finished_at: r.finished_at,
        })
    }
}

fn corrupt(reason: String) -> AppError {
    tracing::error!(%reason, "Corrupt deployment row");
    AppError::internal("Corrupt deployment row", json!({ "reason": reason }))
}

fn lost_ownership(site_id: i64, attempt_id: Uuid) -> AppError {
    AppError::conflict(
        "Deployment attempt no longer owns the record",
        json!({ "site_id": site_id, "attempt_id": attempt_id }),
    )
}

async fn mirror_status(
    tx: &mut Transaction<'_, Postgres>,
    site_id: i64,
    state: PipelineState,
) -> Result<(), AppError> {
    sqlx::query("UPDATE sites SET deploy_status = $2 WHERE id = $1")
        .bind(site_id)
        .bind(state.as_str())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl DeploymentRepository for PgDeploymentRepository {
    async fn find(&self, site_id: i64) -> Result<Option<DeploymentRecord>, AppError> {
        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM deployments WHERE site_id = $1"
        ))
        .bind(site_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(DeploymentRecord::try_from).transpose()
    }

    async fn try_begin(
        &self,
        site_id: i64,
        attempt_id: Uuid,
        domain: &str,
        stale_after: Duration,
    ) -> Result<Option<DeploymentRecord>, AppError> {
        let mut tx = self.pool.begin().await?;

        // The conflict arm only fires when the existing row is terminal or
        // stale; otherwise no row is returned and the reservation is refused.
        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            r#"
            INSERT INTO deployments (site_id, attempt_id, state, domain, started_at, updated_at)
            VALUES ($1, $2, 'queued', $3, NOW(), NOW())
            ON CONFLICT (site_id) DO UPDATE SET
                attempt_id = EXCLUDED.attempt_id,
                state = 'queued',
                stage = NULL,
                domain = EXCLUDED.domain,
                remote_path = NULL,
                bundle_digest = NULL,
                last_error = NULL,
                command_output = NULL,
                started_at = NOW(),
                updated_at = NOW(),
                finished_at = NULL
            WHERE deployments.state IN ('live', 'error', 'cancelled')
               OR deployments.updated_at < NOW() - make_interval(secs => $4)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(site_id)
        .bind(attempt_id)
        .bind(domain)
        .bind(stale_after.num_seconds() as f64)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        mirror_status(&mut tx, site_id, PipelineState::Queued).await?;
        tx.commit().await?;

        DeploymentRecord::try_from(row).map(Some)
    }

    async fn transition(
        &self,
        site_id: i64,
        attempt_id: Uuid,
        state: PipelineState,
        stage: Option<DeployStage>,
        detail: StateDetail,
    ) -> Result<DeploymentRecord, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            r#"
            UPDATE deployments SET
                state = $3,
                stage = $4,
                remote_path = COALESCE($5, remote_path),
                bundle_digest = COALESCE($6, bundle_digest),
                last_error = COALESCE($7, last_error),
                command_output = COALESCE($8, command_output),
                updated_at = NOW(),
                finished_at = CASE WHEN $9 THEN NOW() ELSE NULL END
            WHERE site_id = $1 AND attempt_id = $2
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(site_id)
        .bind(attempt_id)
        .bind(state.as_str())
        .bind(stage.map(|s| s.as_str()))
        .bind(detail.remote_path)
        .bind(detail.bundle_digest)
        .bind(detail.last_error)
        .bind(detail.command_output)
        .bind(state.is_terminal())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| lost_ownership(site_id, attempt_id))?;

        mirror_status(&mut tx, site_id, state).await?;
        tx.commit().await?;

        DeploymentRecord::try_from(row)
    }

    async fn mark_live(
        &self,
        site_id: i64,
        attempt_id: Uuid,
        live: LiveRelease,
        notice: Option<String>,
    ) -> Result<DeploymentRecord, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            r#"
            UPDATE deployments SET
                state = 'live',
                stage = 'live',
                last_error = NULL,
                command_output = $6,
                live_slot = $3,
                live_port = $4,
                live_release = $5,
                updated_at = NOW(),
                finished_at = NOW()
            WHERE site_id = $1 AND attempt_id = $2
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(site_id)
        .bind(attempt_id)
        .bind(live.slot.as_str())
        .bind(i32::from(live.port))
        .bind(&live.release_path)
        .bind(notice)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| lost_ownership(site_id, attempt_id))?;

        mirror_status(&mut tx, site_id, PipelineState::Live).await?;
        tx.commit().await?;

        DeploymentRecord::try_from(row)
    }

    async fn record_attempt(&self, record: DeploymentRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO deployment_attempts
                (attempt_id, site_id, state, stage, domain, remote_path,
                 bundle_digest, last_error, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, COALESCE($10, NOW()))
            ON CONFLICT (attempt_id) DO NOTHING
            "#,
        )
        .bind(record.attempt_id)
        .bind(record.site_id)
        .bind(record.state.as_str())
        .bind(record.stage.map(|s| s.as_str()))
        .bind(&record.domain)
        .bind(&record.remote_path)
        .bind(&record.bundle_digest)
        .bind(&record.last_error)
        .bind(record.started_at)
        .bind(record.finished_at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn history(
        &self,
        site_id: i64,
        limit: i64,
    ) -> Result<Vec<DeploymentAttempt>, AppError> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT attempt_id, site_id, state, stage, domain, remote_path,
                   bundle_digest, last_error, started_at, finished_at
            FROM deployment_attempts
            WHERE site_id = $1
            ORDER BY finished_at DESC
            LIMIT $2
            "#,
        )
        .bind(site_id)
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.into_iter().map(DeploymentAttempt::try_from).collect()
    }
}
