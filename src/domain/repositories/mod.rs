//! Repository trait definitions for the domain layer.
//!
//! Implementations live in `crate::infrastructure::persistence`; mock
//! implementations are generated via `mockall` for unit tests.
//!
//! # Available Repositories
//!
//! - [`ContentRepository`] - Read-only access to sites, pages, media and posts
//! - [`DeploymentRepository`] - Ledger rows and attempt history
//! - [`TokenRepository`] - API token authentication

pub mod content_repository;
pub mod deployment_repository;
pub mod token_repository;

pub use content_repository::ContentRepository;
pub use deployment_repository::DeploymentRepository;
pub use token_repository::{ApiToken, TokenRepository};

#[cfg(test)]
pub use content_repository::MockContentRepository;
#[cfg(test)]
pub use deployment_repository::MockDeploymentRepository;
#[cfg(test)]
pub use token_repository::MockTokenRepository;
