//! Full page documents.
//!
//! The build and the preview share [`render_body`], so a page's `<main>`
//! content is identical in both. They differ only in navigation and in how
//! the stylesheet is attached.

use askama::Template;

use super::diagnostics::RenderDiagnostic;
use super::sections::render_section;
use crate::domain::entities::{ResolvedPage, SiteTheme};

/// One entry of the site navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavItem {
    pub page_id: i64,
    pub title: String,
    pub href: String,
}

/// How a document references the site stylesheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stylesheet {
    /// `<link>` to a file written next to the pages.
    Linked(String),
    /// CSS embedded in the document, used by preview.
    Inline(String),
}

/// Site-wide inputs for rendering a page.
#[derive(Debug, Clone, Copy)]
pub struct PageContext<'a> {
    pub site_name: &'a str,
    pub theme: &'a SiteTheme,
    pub nav: &'a [NavItem],
    pub stylesheet: &'a Stylesheet,
}

/// Rendered page sections in stored order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedBody {
    pub markup: String,
    pub diagnostics: Vec<RenderDiagnostic>,
}

/// A complete HTML document and the findings from its sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub html: String,
    pub diagnostics: Vec<RenderDiagnostic>,
}

struct NavView<'a> {
    title: &'a str,
    href: &'a str,
    current: bool,
}

#[derive(Template)]
#[template(path = "layout.html")]
struct LayoutTemplate<'a> {
    title: String,
    slug: &'a str,
    partial: bool,
    site_name: &'a str,
    nav: Vec<NavView<'a>>,
    stylesheet_href: Option<&'a str>,
    inline_css: Option<&'a str>,
    body: &'a str,
}

#[derive(Template)]
#[template(path = "error_page.html")]
struct ErrorPageTemplate<'a> {
    title: &'a str,
    message: &'a str,
    stylesheet_href: Option<&'a str>,
}

/// Renders every section of a page, concatenated in stored order.
pub fn render_body(page: &ResolvedPage, theme: &SiteTheme) -> RenderedBody {
    let mut markup = String::new();
    let mut diagnostics = Vec::new();

    for (index, section) in page.sections.iter().enumerate() {
        let rendered = render_section(section, theme);
        markup.push_str(&rendered.markup);
        markup.push('\n');
        diagnostics.extend(rendered.diagnostics.into_iter().map(|d| d.at(index)));
    }

    RenderedBody {
        markup,
        diagnostics,
    }
}

/// Renders a page into a full document.
///
/// # Errors
///
/// Returns the template error if the layout itself cannot be rendered.
/// Section failures never surface here; they become diagnostic blocks.
pub fn render_page(page: &ResolvedPage, ctx: PageContext<'_>) -> Result<RenderedPage, askama::Error> {
    let body = render_body(page, ctx.theme);

    let (stylesheet_href, inline_css) = match ctx.stylesheet {
        Stylesheet::Linked(href) => (Some(href.as_str()), None),
        Stylesheet::Inline(css) => (None, Some(css.as_str())),
    };

    let title = if page.title.trim().is_empty() || page.title == ctx.site_name {
        ctx.site_name.to_string()
    } else {
        format!("{} | {}", page.title, ctx.site_name)
    };

    let template = LayoutTemplate {
        title,
        slug: &page.slug,
        partial: page.partial,
        site_name: ctx.site_name,
        nav: ctx
            .nav
            .iter()
            .map(|item| NavView {
                title: &item.title,
                href: &item.href,
                current: item.page_id == page.id,
            })
            .collect(),
        stylesheet_href,
        inline_css,
        body: &body.markup,
    };

    Ok(RenderedPage {
        html: template.render()?,
        diagnostics: body.diagnostics,
    })
}

/// Placeholder document written in place of a page that failed to render.
pub fn render_error_page(title: &str, message: &str, stylesheet: &Stylesheet) -> String {
    let stylesheet_href = match stylesheet {
        Stylesheet::Linked(href) => Some(href.as_str()),
        Stylesheet::Inline(_) => None,
    };
    ErrorPageTemplate {
        title,
        message,
        stylesheet_href,
    }
    .render()
    .unwrap_or_else(|_| {
        "<!DOCTYPE html><html><body><main id=\"content\"><p data-diagnostic=\"error\">This page is temporarily unavailable.</p></main></body></html>".to_string()
    })
}

/// Extracts the `<main>` content of a rendered document.
pub fn main_content(html: &str) -> Option<&str> {
    let start = html.find("<main id=\"content\">")? + "<main id=\"content\">".len();
    let end = html[start..].find("</main>")? + start;
    Some(&html[start..end])
}
