//! Shared application state injected into every handler.

use std::sync::Arc;

use crate::application::services::{AuthService, PipelineService};

/// Cloned per request by axum; all members are reference-counted.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<PipelineService>,
    pub auth_service: Arc<AuthService>,
}

impl AppState {
    pub fn new(pipeline: Arc<PipelineService>, auth_service: Arc<AuthService>) -> Self {
        Self {
            pipeline,
            auth_service,
        }
    }
}
