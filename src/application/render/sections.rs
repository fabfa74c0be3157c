//! Per-type section renderers.
//!
//! Each renderer is a pure function from validated section data to markup.
//! Values outside their allowed range are clamped and reported, unsafe URLs
//! are dropped and reported, and templates escape all text.

use askama::Template;
use chrono::{DateTime, Utc};

use super::diagnostics::{Findings, RenderDiagnostic, Severity};
use super::urls::{css_url, safe_image_src, safe_link};
use crate::domain::entities::section::{
    BlogData, ContactData, GalleryData, HeroData, ImageData, MapData, SocialData, TextData,
};
use crate::domain::entities::{ImageSlot, Section, SiteTheme};

/// Markup for one section plus whatever the renderer had to adjust.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSection {
    pub markup: String,
    pub diagnostics: Vec<RenderDiagnostic>,
}

/// Emitted if even the diagnostic template cannot be rendered.
const UNRENDERABLE: &str = r#"<section class="section section-diagnostic" data-diagnostic="error" data-section-type="unrenderable"><p class="diagnostic-title">This section could not be displayed.</p></section>"#;

pub const GALLERY_COLUMNS: (i64, i64) = (1, 6);
pub const GALLERY_LIMIT: (i64, i64) = (1, 48);
pub const BLOG_LIMIT: (i64, i64) = (1, 12);
pub const MAP_ZOOM: (i64, i64) = (1, 20);
pub const MAP_HEIGHT: (i64, i64) = (150, 800);
pub const IMAGE_WIDTH: (i64, i64) = (10, 100);

const DEFAULT_BLOG_LIMIT: i64 = 3;
const DEFAULT_MAP_ZOOM: i64 = 14;
const DEFAULT_MAP_HEIGHT: i64 = 320;

/// Renders one section. Never fails: anything that cannot be rendered is
/// replaced by a labelled diagnostic block.
pub fn render_section(section: &Section, theme: &SiteTheme) -> RenderedSection {
    let result = match section {
        Section::Hero(data) => hero(data, theme),
        Section::Text(data) => text(data),
        Section::Image(data) => image(data),
        Section::Gallery(data) => gallery(data, theme),
        Section::Contact(data) => contact(data),
        Section::Social(data) => social(data),
        Section::Blog(data) => blog(data),
        Section::Map(data) => map(data),
        Section::Unknown { kind } => {
            return diagnostic_block(
                kind,
                format!("Unsupported section type \"{kind}\""),
                "This build does not know how to display this section.".to_string(),
            );
        }
        Section::Malformed { kind, reason } => {
            return diagnostic_block(
                kind,
                format!("This {kind} section could not be displayed"),
                reason.clone(),
            );
        }
    };

    match result {
        Ok(rendered) => rendered,
        Err(e) => {
            tracing::warn!(section = section.kind_label(), error = %e, "Section template failed");
            diagnostic_block(
                section.kind_label(),
                format!("This {} section could not be displayed", section.kind_label()),
                e.to_string(),
            )
        }
    }
}

/// A visible placeholder for a section that was not rendered.
fn diagnostic_block(kind: &str, title: String, reason: String) -> RenderedSection {
    let template = DiagnosticTemplate {
        severity: Severity::Error.as_str(),
        kind,
        title: &title,
        reason: &reason,
    };
    let markup = template
        .render()
        .unwrap_or_else(|_| UNRENDERABLE.to_string());

    RenderedSection {
        markup,
        diagnostics: vec![RenderDiagnostic::error(kind, format!("{title}: {reason}"))],
    }
}

#[derive(Template)]
#[template(path = "sections/diagnostic.html")]
struct DiagnosticTemplate<'a> {
    severity: &'a str,
    kind: &'a str,
    title: &'a str,
    reason: &'a str,
}

struct ImageView {
    src: String,
    alt: String,
}

/// Resolves an image slot to something the templates can emit.
fn image_view(slot: &ImageSlot, findings: &mut Findings) -> Option<ImageView> {
    let (candidate, alt) = match (&slot.media, slot.id, &slot.url) {
        (Some(media), _, _) => (
            media.url.clone(),
            media.alt.clone().or_else(|| slot.alt.clone()),
        ),
        (None, Some(id), _) => {
            findings.warn(format!("media #{id} could not be resolved"));
            return None;
        }
        (None, None, Some(url)) => (url.clone(), slot.alt.clone()),
        (None, None, None) => {
            findings.warn("image reference is empty");
            return None;
        }
    };

    match safe_image_src(&candidate) {
        Some(src) => Some(ImageView {
            src,
            alt: alt.unwrap_or_default(),
        }),
        None => {
            findings.warn(format!("image source for {} was dropped as unsafe", slot.describe()));
            None
        }
    }
}

fn link_or_warn(raw: &str, what: &str, findings: &mut Findings) -> Option<String> {
    let link = safe_link(raw);
    if link.is_none() {
        findings.warn(format!("{what} link \"{raw}\" was dropped as unsafe"));
    }
    link
}

fn pick<'a>(
    value: Option<&str>,
    allowed: &[&'a str],
    field: &str,
    findings: &mut Findings,
) -> &'a str {
    let default = allowed[0];
    let Some(raw) = value else {
        return default;
    };
    let wanted = raw.trim().to_ascii_lowercase();
    match allowed.iter().find(|candidate| **candidate == wanted) {
        Some(found) => *found,
        None => {
            findings.warn(format!("{field} \"{raw}\" is not supported; using {default}"));
            default
        }
    }
}

fn finish<T: Template>(template: T, findings: Findings) -> askama::Result<RenderedSection> {
    Ok(RenderedSection {
        markup: template.render()?,
        diagnostics: findings.into_vec(),
    })
}

// ---------------------------------------------------------------------------
// Hero

struct CallToAction {
    label: String,
    href: String,
}

#[derive(Template)]
#[template(path = "sections/hero.html")]
struct HeroTemplate {
    title: String,
    subtitle: Option<String>,
    background: Option<String>,
    cta: Option<CallToAction>,
    align: &'static str,
    style: &'static str,
}

fn hero(data: &HeroData, theme: &SiteTheme) -> askama::Result<RenderedSection> {
    let mut findings = Findings::new("hero");

    let background = data
        .background
        .as_ref()
        .and_then(|slot| image_view(slot, &mut findings))
        .and_then(|img| {
            let url = css_url(&img.src);
            if url.is_none() {
                findings.warn("background image URL cannot be used in a stylesheet");
            }
            url
        });

    let cta = match data.cta_href.as_deref() {
        Some(href) => link_or_warn(href, "call-to-action", &mut findings).map(|href| {
            CallToAction {
                label: data
                    .cta_label
                    .clone()
                    .filter(|l| !l.trim().is_empty())
                    .unwrap_or_else(|| "Learn more".to_string()),
                href,
            }
        }),
        None => None,
    };

    let align = pick(
        data.align.as_deref(),
        &["center", "left", "right"],
        "alignment",
        &mut findings,
    );

    let template = HeroTemplate {
        title: data.title.clone(),
        subtitle: data.subtitle.clone().filter(|s| !s.trim().is_empty()),
        background,
        cta,
        align,
        style: theme.hero_style.as_str(),
    };
    finish(template, findings)
}

// ---------------------------------------------------------------------------
// Text

#[derive(Template)]
#[template(path = "sections/text.html")]
struct TextTemplate {
    heading: Option<String>,
    paragraphs: Vec<Vec<String>>,
}

fn text(data: &TextData) -> askama::Result<RenderedSection> {
    let paragraphs = data
        .body
        .replace("\r\n", "\n")
        .split("\n\n")
        .map(|para| {
            para.lines()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|lines| !lines.is_empty())
        .collect();

    let template = TextTemplate {
        heading: data.heading.clone(),
        paragraphs,
    };
    finish(template, Findings::new("text"))
}

// ---------------------------------------------------------------------------
// Image

#[derive(Template)]
#[template(path = "sections/image.html")]
struct ImageTemplate {
    image: Option<ImageView>,
    caption: Option<String>,
    width: i64,
}

fn image(data: &ImageData) -> askama::Result<RenderedSection> {
    let mut findings = Findings::new("image");
    let (min, max) = IMAGE_WIDTH;
    let width = findings.clamp("width", data.width, 100, min, max);

    let template = ImageTemplate {
        image: image_view(&data.image, &mut findings),
        caption: data.caption.clone(),
        width,
    };
    finish(template, findings)
}

// ---------------------------------------------------------------------------
// Gallery

#[derive(Template)]
#[template(path = "sections/gallery.html")]
struct GalleryTemplate {
    title: Option<String>,
    images: Vec<ImageView>,
    layout: &'static str,
    columns: i64,
}

fn gallery(data: &GalleryData, theme: &SiteTheme) -> askama::Result<RenderedSection> {
    let mut findings = Findings::new("gallery");

    let (min_cols, max_cols) = GALLERY_COLUMNS;
    let default_columns = theme.gallery_columns.clamp(min_cols, max_cols);
    let columns = findings.clamp("columns", data.columns, default_columns, min_cols, max_cols);

    let (min_limit, max_limit) = GALLERY_LIMIT;
    let limit = findings.clamp("limit", data.limit, max_limit, min_limit, max_limit);

    let layout = pick(
        data.layout.as_deref(),
        &["grid", "masonry", "carousel"],
        "layout",
        &mut findings,
    );

    let images = data
        .images
        .iter()
        .take(limit as usize)
        .filter_map(|slot| image_view(slot, &mut findings))
        .collect();

    let template = GalleryTemplate {
        title: data.title.clone(),
        images,
        layout,
        columns,
    };
    finish(template, findings)
}

// ---------------------------------------------------------------------------
// Contact

struct FieldView {
    id: String,
    label: String,
    kind: &'static str,
}

#[derive(Template)]
#[template(path = "sections/contact.html")]
struct ContactTemplate {
    heading: String,
    email: String,
    mailto: String,
    phone: Option<String>,
    phone_href: Option<String>,
    address: Option<String>,
    fields: Vec<FieldView>,
    action: String,
    submit_label: String,
}

fn field_view(raw: &str) -> Option<FieldView> {
    let label = raw.trim();
    let id: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if id.is_empty() {
        return None;
    }

    let kind = match id.as_str() {
        "email" | "e-mail" => "email",
        "phone" | "tel" | "telephone" => "tel",
        "message" | "comment" | "comments" => "textarea",
        _ => "text",
    };

    Some(FieldView {
        id: format!("contact-{id}"),
        label: label.to_string(),
        kind,
    })
}

fn contact(data: &ContactData) -> askama::Result<RenderedSection> {
    let mut findings = Findings::new("contact");

    let mailto = format!("mailto:{}", data.email);

    let phone = data.phone.clone().filter(|p| !p.trim().is_empty());
    let phone_href = phone.as_ref().and_then(|p| {
        let digits: String = p
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '+')
            .collect();
        link_or_warn(&format!("tel:{digits}"), "phone", &mut findings)
    });

    let action = data
        .action
        .as_deref()
        .and_then(|a| link_or_warn(a, "form action", &mut findings))
        .unwrap_or_else(|| mailto.clone());

    let fields = data
        .fields
        .iter()
        .filter_map(|f| {
            let view = field_view(f);
            if view.is_none() {
                findings.warn(format!("form field \"{f}\" has no usable name"));
            }
            view
        })
        .collect();

    let template = ContactTemplate {
        heading: data
            .heading
            .clone()
            .unwrap_or_else(|| "Contact".to_string()),
        email: data.email.clone(),
        mailto,
        phone,
        phone_href,
        address: data.address.clone(),
        fields,
        action,
        submit_label: data
            .submit_label
            .clone()
            .unwrap_or_else(|| "Send".to_string()),
    };
    finish(template, findings)
}

// ---------------------------------------------------------------------------
// Social

struct SocialView {
    platform: String,
    class_name: String,
    href: String,
}

#[derive(Template)]
#[template(path = "sections/social.html")]
struct SocialTemplate {
    heading: Option<String>,
    links: Vec<SocialView>,
}

fn social(data: &SocialData) -> askama::Result<RenderedSection> {
    let mut findings = Findings::new("social");

    let links = data
        .links
        .iter()
        .filter_map(|link| {
            let href = link_or_warn(&link.url, &link.platform, &mut findings)?;
            let class_name: String = link
                .platform
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_lowercase())
                .collect();
            Some(SocialView {
                platform: link.platform.clone(),
                class_name: if class_name.is_empty() {
                    "link".to_string()
                } else {
                    class_name
                },
                href,
            })
        })
        .collect();

    let template = SocialTemplate {
        heading: data.heading.clone(),
        links,
    };
    finish(template, findings)
}

// ---------------------------------------------------------------------------
// Blog

struct PostDate {
    label: String,
    iso: String,
}

struct PostView {
    title: String,
    excerpt: String,
    href: Option<String>,
    date: Option<PostDate>,
}

#[derive(Template)]
#[template(path = "sections/blog.html")]
struct BlogTemplate {
    heading: String,
    posts: Vec<PostView>,
}

fn format_date(at: &DateTime<Utc>) -> PostDate {
    PostDate {
        label: at.format("%B %-d, %Y").to_string(),
        iso: at.to_rfc3339(),
    }
}

fn blog(data: &BlogData) -> askama::Result<RenderedSection> {
    let mut findings = Findings::new("blog");
    let (min, max) = BLOG_LIMIT;
    let limit = findings.clamp("limit", data.limit, DEFAULT_BLOG_LIMIT, min, max);

    let posts = data
        .posts
        .iter()
        .take(limit as usize)
        .map(|post| PostView {
            title: post.title.clone(),
            excerpt: post.excerpt.clone(),
            href: post
                .url
                .as_deref()
                .and_then(|u| link_or_warn(u, "post", &mut findings)),
            date: post.published_at.as_ref().map(format_date),
        })
        .collect();

    let template = BlogTemplate {
        heading: data
            .heading
            .clone()
            .unwrap_or_else(|| "Latest posts".to_string()),
        posts,
    };
    finish(template, findings)
}

// ---------------------------------------------------------------------------
// Map

#[derive(Template)]
#[template(path = "sections/map.html")]
struct MapTemplate {
    address: Option<String>,
    lat: String,
    lng: String,
    zoom: i64,
    height: i64,
    href: String,
}

fn map(data: &MapData) -> askama::Result<RenderedSection> {
    let mut findings = Findings::new("map");
    let (min_zoom, max_zoom) = MAP_ZOOM;
    let zoom = findings.clamp("zoom", data.zoom, DEFAULT_MAP_ZOOM, min_zoom, max_zoom);
    let (min_h, max_h) = MAP_HEIGHT;
    let height = findings.clamp("height", data.height, DEFAULT_MAP_HEIGHT, min_h, max_h);

    let lat = format!("{:.6}", data.lat);
    let lng = format!("{:.6}", data.lng);
    let href = format!("https://www.openstreetmap.org/?mlat={lat}&mlon={lng}#map={zoom}/{lat}/{lng}");

    let template = MapTemplate {
        address: data.address.clone(),
        lat,
        lng,
        zoom,
        height,
        href,
    };
    finish(template, findings)
}
