//! Typed failures of the pipeline components.

use std::path::PathBuf;
use thiserror::Error;

use super::entities::{DeployStage, DeploymentRecord};
use super::remote::RemoteError;

/// The content resolver could not produce a site model.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("site {0} not found")]
    NotFound(i64),

    #[error("published page '{slug}' not found for site {site_id}")]
    PageNotFound { site_id: i64, slug: String },

    #[error("content store unavailable: {0}")]
    Store(String),
}

/// The site builder could not write an artifact.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {file}: {source}")]
    Encode {
        file: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Packaging an artifact into a bundle failed. No partial bundle is left behind.
#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("artifact directory {} does not exist", .0.display())]
    MissingArtifact(PathBuf),

    #[error("failed to write bundle {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode deploy descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),
}

impl PackagingError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Ledger refusals and storage failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("a deployment is already in progress for site {site_id}")]
    DeployInProgress { site_id: i64 },

    #[error("deployment for site {site_id} is already switching traffic and can no longer be cancelled")]
    CancelTooLate { site_id: i64 },

    #[error("no cancellable deployment is in flight for site {site_id}")]
    NothingInFlight { site_id: i64 },

    #[error("deployment store error: {0}")]
    Store(String),
}

/// Underlying cause of a pipeline failure.
#[derive(Debug, Error)]
pub enum PipelineCause {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Packaging(#[from] PackagingError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// A failed pipeline run.
///
/// `stage` is `None` when the run was refused before any stage started.
/// `record` carries the ledger row as written after the failure.
#[derive(Debug, Error)]
#[error("{}", describe(.stage, .cause))]
pub struct PipelineError {
    pub stage: Option<DeployStage>,
    pub cause: PipelineCause,
    pub record: Option<Box<DeploymentRecord>>,
}

fn describe(stage: &Option<DeployStage>, cause: &PipelineCause) -> String {
    match stage {
        Some(stage) => format!("{stage} failed: {cause}"),
        None => cause.to_string(),
    }
}

impl PipelineError {
    pub fn at(
        stage: DeployStage,
        cause: impl Into<PipelineCause>,
        record: Option<DeploymentRecord>,
    ) -> Self {
        Self {
            stage: Some(stage),
            cause: cause.into(),
            record: record.map(Box::new),
        }
    }

    pub fn before_start(cause: impl Into<PipelineCause>) -> Self {
        Self {
            stage: None,
            cause: cause.into(),
            record: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, PipelineCause::Remote(RemoteError::Cancelled))
    }
}

impl From<ResolveError> for PipelineError {
    fn from(e: ResolveError) -> Self {
        Self::before_start(e)
    }
}

impl From<LedgerError> for PipelineError {
    fn from(e: LedgerError) -> Self {
        Self::before_start(e)
    }
}
