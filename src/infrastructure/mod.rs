//! Infrastructure layer for external integrations.
//!
//! Concrete implementations of the traits defined by the domain layer.
//!
//! # Modules
//!
//! - [`media`] - Object storage URL resolution with a local fallback
//! - [`persistence`] - PostgreSQL repository implementations
//! - [`ssh`] - Remote hosts through the system OpenSSH client

pub mod media;
pub mod persistence;
pub mod ssh;
