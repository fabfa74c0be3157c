//! HTTP request handlers for API endpoints.
//!
//! Each handler module corresponds to a logical grouping of endpoints.

pub mod cleanup;
pub mod deploy;
pub mod generate;
pub mod health;
pub mod preview;

pub use cleanup::cleanup_handler;
pub use deploy::{cancel_handler, deploy_handler, history_handler, status_handler};
pub use generate::generate_handler;
pub use health::health_handler;
pub use preview::{DIAGNOSTICS_HEADER, preview_handler};
