//! Core domain entities.
//!
//! Entities are plain data: the content store's rows ([`Site`], [`Page`],
//! [`MediaAsset`]), the parsed [`Section`] model, the [`SiteModel`] aggregate
//! handed to the builder, and the records the deployment ledger persists.
//!
//! # Entity Types
//!
//! - [`Site`], [`SiteTheme`] - A tenant website and its validated style tokens
//! - [`Page`] - Raw page rows, content unparsed
//! - [`Section`] - Typed content blocks with explicit fallback variants
//! - [`SiteModel`] - Resolved snapshot of one site for one build
//! - [`BuildArtifact`], [`DeployBundle`] - Local build outputs
//! - [`DeploymentRecord`] - Ledger row describing a site's current attempt

pub mod artifact;
pub mod bundle;
pub mod deployment;
pub mod media;
pub mod page;
pub mod section;
pub mod site;
pub mod site_model;

pub use artifact::{BuildArtifact, Manifest, ManifestPage, PageReport};
pub use bundle::{DeployBundle, DeployDescriptor};
pub use deployment::{
    DeployStage, DeploymentAttempt, DeploymentRecord, LiveRelease, PipelineState, Slot,
    StateDetail,
};
pub use media::{BlogPostSummary, MediaAsset, MediaReference};
pub use page::Page;
pub use section::{ImageSlot, Section, SectionKind};
pub use site::{HeroStyle, Site, SiteTheme};
pub use site_model::{DegradedPage, ResolvedPage, SiteModel};
