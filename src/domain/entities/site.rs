//! Site entity and theme tokens.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::LazyLock;

static COLOR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(#[0-9a-fA-F]{3}|#[0-9a-fA-F]{6}|#[0-9a-fA-F]{8}|[a-zA-Z]{3,20})$")
        .expect("valid color regex")
});

static FONT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^[A-Za-z0-9 ,'"-]{1,120}$"#).expect("valid font regex"));

static RADIUS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,2}(px|rem|em)$").expect("valid radius regex"));

/// A tenant's website as stored in the content database.
///
/// `theme` holds the raw style tokens edited in the admin UI; use
/// [`SiteTheme::from_tokens`] to obtain validated values.
#[derive(Debug, Clone)]
pub struct Site {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub domain: Option<String>,
    pub theme: Value,
    pub deploy_status: String,
    pub updated_at: DateTime<Utc>,
}

impl Site {
    /// Creates a new Site instance.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i64,
        tenant_id: i64,
        name: String,
        domain: Option<String>,
        theme: Value,
        deploy_status: String,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id,
            name,
            domain,
            theme,
            deploy_status,
            updated_at,
        }
    }

    /// Directory and process key used for this site on disk and on target hosts.
    pub fn key(&self) -> String {
        site_key(self.id)
    }
}

/// Returns the stable `site-{id}` key used for directories and process names.
pub fn site_key(site_id: i64) -> String {
    format!("site-{site_id}")
}

/// How the hero section is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeroStyle {
    Overlay,
    Plain,
}

impl HeroStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeroStyle::Overlay => "overlay",
            HeroStyle::Plain => "plain",
        }
    }
}

/// Validated theme tokens used by the renderer and the stylesheet generator.
///
/// Every field has a default; invalid tokens fall back to it so that a
/// malformed theme never leaks into generated CSS.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteTheme {
    pub primary_color: String,
    pub accent_color: String,
    pub background_color: String,
    pub text_color: String,
    pub font_family: String,
    pub heading_font: String,
    pub border_radius: String,
    pub hero_style: HeroStyle,
    pub gallery_columns: i64,
}

impl Default for SiteTheme {
    fn default() -> Self {
        Self {
            primary_color: "#1f2937".to_string(),
            accent_color: "#2563eb".to_string(),
            background_color: "#ffffff".to_string(),
            text_color: "#111827".to_string(),
            font_family: "system-ui, sans-serif".to_string(),
            heading_font: "system-ui, sans-serif".to_string(),
            border_radius: "6px".to_string(),
            hero_style: HeroStyle::Overlay,
            gallery_columns: 3,
        }
    }
}

impl SiteTheme {
    /// Builds a theme from raw tokens, returning the names of tokens that were
    /// rejected and replaced by defaults.
    ///
    /// Accepts both `camelCase` and `snake_case` keys.
    pub fn from_tokens(tokens: &Value) -> (Self, Vec<String>) {
        let mut theme = Self::default();
        let mut rejected = Vec::new();

        let Some(map) = tokens.as_object() else {
            if !tokens.is_null() {
                rejected.push("theme".to_string());
            }
            return (theme, rejected);
        };

        let lookup = |snake: &str, camel: &str| map.get(snake).or_else(|| map.get(camel));

        let mut apply = |snake: &str, camel: &str, regex: &Regex, target: &mut String| {
            if let Some(value) = lookup(snake, camel) {
                match value.as_str().map(str::trim) {
                    Some(s) if regex.is_match(s) => *target = s.to_string(),
                    _ => rejected.push(snake.to_string()),
                }
            }
        };

        apply("primary_color", "primaryColor", &COLOR_REGEX, &mut theme.primary_color);
        apply("accent_color", "accentColor", &COLOR_REGEX, &mut theme.accent_color);
        apply(
            "background_color",
            "backgroundColor",
            &COLOR_REGEX,
            &mut theme.background_color,
        );
        apply("text_color", "textColor", &COLOR_REGEX, &mut theme.text_color);
        apply("font_family", "fontFamily", &FONT_REGEX, &mut theme.font_family);
        apply("heading_font", "headingFont", &FONT_REGEX, &mut theme.heading_font);
        apply("border_radius", "borderRadius", &RADIUS_REGEX, &mut theme.border_radius);

        if let Some(value) = lookup("hero_style", "heroStyle") {
            match value.as_str() {
                Some("overlay") => theme.hero_style = HeroStyle::Overlay,
                Some("plain") => theme.hero_style = HeroStyle::Plain,
                _ => rejected.push("hero_style".to_string()),
            }
        }

        if let Some(value) = lookup("gallery_columns", "galleryColumns") {
            match value.as_i64() {
                Some(n) if (1..=6).contains(&n) => theme.gallery_columns = n,
                _ => rejected.push("gallery_columns".to_string()),
            }
        }

        (theme, rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_theme_defaults_for_null_tokens() {
        let (theme, rejected) = SiteTheme::from_tokens(&Value::Null);
        assert_eq!(theme, SiteTheme::default());
        assert!(rejected.is_empty());
    }

    #[test]
    fn test_theme_accepts_camel_and_snake_case() {
        let (theme, rejected) = SiteTheme::from_tokens(&json!({
            "primaryColor": "#ff0000",
            "text_color": "navy",
            "fontFamily": "Inter, sans-serif",
            "heroStyle": "plain",
            "galleryColumns": 4
        }));

        assert!(rejected.is_empty());
        assert_eq!(theme.primary_color, "#ff0000");
        assert_eq!(theme.text_color, "navy");
        assert_eq!(theme.font_family, "Inter, sans-serif");
        assert_eq!(theme.hero_style, HeroStyle::Plain);
        assert_eq!(theme.gallery_columns, 4);
    }

    #[test]
    fn test_theme_rejects_css_injection() {
        let (theme, rejected) = SiteTheme::from_tokens(&json!({
            "primary_color": "red; } body { display: none",
            "border_radius": "url(javascript:alert(1))",
            "gallery_columns": 40
        }));

        assert_eq!(theme.primary_color, SiteTheme::default().primary_color);
        assert_eq!(theme.border_radius, SiteTheme::default().border_radius);
        assert_eq!(theme.gallery_columns, 3);
        assert_eq!(
            rejected,
            vec!["primary_color", "border_radius", "gallery_columns"]
        );
    }

    #[test]
    fn test_site_key() {
        assert_eq!(site_key(42), "site-42");
    }
}
