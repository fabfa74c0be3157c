//! PostgreSQL repository implementations.
//!
//! Queries are built at runtime with `query_as` and `FromRow` rows, so the
//! crate builds without a live database.
//!
//! # Repositories
//!
//! - [`PgContentRepository`] - Sites, pages, media and blog posts (read-only)
//! - [`PgDeploymentRepository`] - Deployment records and attempt history
//! - [`PgTokenRepository`] - API token storage and validation

pub mod pg_content_repository;
pub mod pg_deployment_repository;
pub mod pg_token_repository;

pub use pg_content_repository::PgContentRepository;
pub use pg_deployment_repository::PgDeploymentRepository;
pub use pg_token_repository::PgTokenRepository;
