//! Domain layer: entities, repository contracts and component errors.
//!
//! Nothing here depends on the database, the HTTP layer or ssh.
//!
//! # Architecture
//!
//! - [`entities`] - Sites, pages, typed sections and deployment records
//! - [`repositories`] - Data access trait definitions
//! - [`remote`] - Contracts for talking to target hosts
//! - [`errors`] - Typed failures of each pipeline component

pub mod entities;
pub mod errors;
pub mod remote;
pub mod repositories;
