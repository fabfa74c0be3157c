//! Application layer: rendering and the pipeline services.
//!
//! Services consume the repository and remote-host traits from the domain
//! layer and expose the operations used by the HTTP API and the admin CLI.
//!
//! # Modules
//!
//! - [`render`] - Section renderers, page layout and stylesheet
//! - [`services`] - Resolver, builder, packager, deployer, ledger and the
//!   [`services::PipelineService`] that sequences them

pub mod render;
pub mod services;
