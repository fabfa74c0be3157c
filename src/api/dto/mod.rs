//! Data Transfer Objects for API requests and responses.
//!
//! Request bodies use Serde for deserialization and validator for input
//! validation. Most responses serialize the service reports directly.

pub mod deploy;
pub mod health;

pub use deploy::{AuthBody, DeployBody, HistoryParams, HostBody};
pub use health::{CheckStatus, HealthChecks, HealthResponse, Overall, ProbeStatus};
