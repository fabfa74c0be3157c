//! Deployment state persisted by the ledger.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Coarse pipeline state shown to operators and mirrored onto the site row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Queued,
    Building,
    Packaging,
    Uploading,
    Provisioning,
    Live,
    Error,
    Cancelled,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Building => "building",
            Self::Packaging => "packaging",
            Self::Uploading => "uploading",
            Self::Provisioning => "provisioning",
            Self::Live => "live",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states release the per-site reservation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Live | Self::Error | Self::Cancelled)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => Self::Queued,
            "building" => Self::Building,
            "packaging" => Self::Packaging,
            "uploading" => Self::Uploading,
            "provisioning" => Self::Provisioning,
            "live" => Self::Live,
            "error" => Self::Error,
            "cancelled" => Self::Cancelled,
            other => return Err(format!("unknown pipeline state '{other}'")),
        })
    }
}

/// Fine-grained stage of one deployment attempt.
///
/// `Generating` and `Packaging` run locally; the rest form the remote
/// deployer's state machine in the order declared here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    Generating,
    Packaging,
    Connecting,
    Uploading,
    Extracting,
    Installing,
    Building,
    Supervising,
    RoutingConfigured,
    Live,
}

impl DeployStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generating => "generating",
            Self::Packaging => "packaging",
            Self::Connecting => "connecting",
            Self::Uploading => "uploading",
            Self::Extracting => "extracting",
            Self::Installing => "installing",
            Self::Building => "building",
            Self::Supervising => "supervising",
            Self::RoutingConfigured => "routing_configured",
            Self::Live => "live",
        }
    }

    /// The coarse state an attempt is in while this stage runs.
    pub fn pipeline_state(&self) -> PipelineState {
        match self {
            Self::Generating => PipelineState::Building,
            Self::Packaging => PipelineState::Packaging,
            Self::Connecting | Self::Uploading => PipelineState::Uploading,
            Self::Extracting
            | Self::Installing
            | Self::Building
            | Self::Supervising
            | Self::RoutingConfigured => PipelineState::Provisioning,
            Self::Live => PipelineState::Live,
        }
    }

    /// True for stages executed on the target host.
    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Generating | Self::Packaging)
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "generating" => Self::Generating,
            "packaging" => Self::Packaging,
            "connecting" => Self::Connecting,
            "uploading" => Self::Uploading,
            "extracting" => Self::Extracting,
            "installing" => Self::Installing,
            "building" => Self::Building,
            "supervising" => Self::Supervising,
            "routing_configured" => Self::RoutingConfigured,
            "live" => Self::Live,
            other => return Err(format!("unknown deploy stage '{other}'")),
        })
    }
}

/// Blue/green process slot on the target host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    Blue,
    Green,
}

impl Slot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }

    /// Port offset from the host's base application port.
    pub fn port_offset(&self) -> u16 {
        match self {
            Self::Blue => 0,
            Self::Green => 1,
        }
    }
}

impl FromStr for Slot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blue" => Ok(Self::Blue),
            "green" => Ok(Self::Green),
            other => Err(format!("unknown slot '{other}'")),
        }
    }
}

/// The release currently receiving traffic for a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveRelease {
    pub slot: Slot,
    pub port: u16,
    pub release_path: String,
}

/// Current (or last) deployment attempt for one site.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentRecord {
    pub site_id: i64,
    pub attempt_id: Uuid,
    pub state: PipelineState,
    /// Stage in progress, or the failing stage when `state` is `Error`.
    pub stage: Option<DeployStage>,
    pub domain: String,
    pub remote_path: Option<String>,
    pub bundle_digest: Option<String>,
    pub last_error: Option<String>,
    /// Captured output of the failing remote command.
    pub command_output: Option<String>,
    /// Left untouched by failed attempts.
    pub live: Option<LiveRelease>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeploymentRecord {
    /// Stage at which the attempt failed, if it did.
    pub fn error_stage(&self) -> Option<DeployStage> {
        match self.state {
            PipelineState::Error => self.stage,
            _ => None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        !self.state.is_terminal()
    }
}

/// A finished attempt kept for auditing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentAttempt {
    pub attempt_id: Uuid,
    pub site_id: i64,
    pub state: PipelineState,
    pub stage: Option<DeployStage>,
    pub domain: String,
    pub remote_path: Option<String>,
    pub bundle_digest: Option<String>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A state transition written by the pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDetail {
    pub remote_path: Option<String>,
    pub bundle_digest: Option<String>,
    pub last_error: Option<String>,
    pub command_output: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_state_mapping() {
        assert_eq!(
            DeployStage::Generating.pipeline_state(),
            PipelineState::Building
        );
        assert_eq!(
            DeployStage::Connecting.pipeline_state(),
            PipelineState::Uploading
        );
        assert_eq!(
            DeployStage::Building.pipeline_state(),
            PipelineState::Provisioning
        );
        assert_eq!(DeployStage::Live.pipeline_state(), PipelineState::Live);
    }

    #[test]
    fn test_stage_order_follows_state_machine() {
        assert!(DeployStage::Connecting < DeployStage::Uploading);
        assert!(DeployStage::Supervising < DeployStage::RoutingConfigured);
        assert!(DeployStage::RoutingConfigured < DeployStage::Live);
    }

    #[test]
    fn test_round_trip_through_strings() {
        for stage in [
            DeployStage::Packaging,
            DeployStage::RoutingConfigured,
            DeployStage::Live,
        ] {
            assert_eq!(stage.as_str().parse::<DeployStage>(), Ok(stage));
        }
        assert_eq!("cancelled".parse(), Ok(PipelineState::Cancelled));
        assert!("sideways".parse::<PipelineState>().is_err());
    }

    #[test]
    fn test_slot_alternates() {
        assert_eq!(Slot::Blue.other(), Slot::Green);
        assert_eq!(Slot::Green.other().port_offset(), 0);
    }
}
