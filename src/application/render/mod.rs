//! Section Renderer.
//!
//! Pure functions from typed sections and theme tokens to HTML. Used by the
//! site builder for full builds and by the preview endpoint for single pages.

mod diagnostics;
mod layout;
mod sections;
mod stylesheet;
pub mod urls;

pub use diagnostics::{RenderDiagnostic, Severity};
pub use layout::{
    NavItem, PageContext, RenderedBody, RenderedPage, Stylesheet, main_content, render_body,
    render_error_page, render_page,
};
pub use sections::{
    BLOG_LIMIT, GALLERY_COLUMNS, GALLERY_LIMIT, IMAGE_WIDTH, MAP_HEIGHT, MAP_ZOOM,
    RenderedSection, render_section,
};
pub use stylesheet::stylesheet;
