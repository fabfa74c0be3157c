//! Pipeline components and the services built on them.

pub mod auth_service;
pub mod content_resolver;
pub mod deployment_ledger;
pub mod packager;
pub mod pipeline_service;
pub mod remote_deployer;
pub mod site_builder;

pub use auth_service::AuthService;
pub use content_resolver::ContentResolver;
pub use deployment_ledger::{AttemptHandle, DeploymentLedger};
pub use packager::{DescriptorTemplate, Packager};
pub use pipeline_service::{
    CleanupReport, DeployRequest, GenerateReport, HealthReport, PipelineService, PreviewPage,
};
pub use remote_deployer::{DeployerSettings, ProxySettings, RemoteDeployer, is_valid_domain};
pub use site_builder::SiteBuilder;
