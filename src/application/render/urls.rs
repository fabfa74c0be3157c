//! URL checks applied to every link and image source in generated markup.

use url::Url;

/// Schemes allowed in links.
const LINK_SCHEMES: &[&str] = &["http", "https", "mailto", "tel"];

/// Schemes allowed for image sources.
const IMAGE_SCHEMES: &[&str] = &["http", "https"];

/// Returns the trimmed URL if it is safe to emit as an `href`.
///
/// Accepts absolute `http(s)`, `mailto:` and `tel:` URLs, plus site-relative
/// paths and fragments. Protocol-relative URLs (`//host`) are rejected.
pub fn safe_link(raw: &str) -> Option<String> {
    check(raw, LINK_SCHEMES)
}

/// Returns the trimmed URL if it is safe to use as an image source.
pub fn safe_image_src(raw: &str) -> Option<String> {
    check(raw, IMAGE_SCHEMES)
}

/// Makes an image URL safe to embed inside CSS `url('...')`.
///
/// Returns `None` when the value contains characters that could close the
/// CSS string or function.
pub fn css_url(raw: &str) -> Option<String> {
    let src = safe_image_src(raw)?;
    if src
        .chars()
        .any(|c| matches!(c, '\'' | '"' | '(' | ')' | '\\' | ';' | '<' | '>') || c.is_whitespace())
    {
        return None;
    }
    Some(src)
}

fn check(raw: &str, schemes: &[&str]) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_control) {
        return None;
    }

    if is_site_relative(trimmed) {
        return Some(trimmed.to_string());
    }

    let parsed = Url::parse(trimmed).ok()?;
    if !schemes.contains(&parsed.scheme()) {
        return None;
    }
    if matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_none() {
        return None;
    }
    Some(trimmed.to_string())
}

fn is_site_relative(value: &str) -> bool {
    (value.starts_with('/') && !value.starts_with("//") && !value.starts_with("/\\"))
        || value.starts_with('#')
        || value.starts_with('?')
}
