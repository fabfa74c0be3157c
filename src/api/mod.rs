//! HTTP API for driving the pipeline.
//!
//! Every route under `/api` is token-protected and maps onto one
//! [`PipelineService`](crate::application::services::PipelineService)
//! operation. Long-running deploys are answered when the run finishes.
//!
//! - [`dto`] - request bodies and validation
//! - [`handlers`] - one handler per pipeline operation
//! - [`middleware`] - bearer auth, rate limiting, request tracing
//! - [`routes`] - the protected route table

pub mod dto;
pub mod handlers;
pub mod middleware;
pub mod routes;
