//! Typed page sections.
//!
//! Stored page content is a JSON list of `{type, data}` records. Each record is
//! parsed into the closed [`Section`] enum; records that cannot be understood
//! become [`Section::Unknown`] or [`Section::Malformed`] instead of failing the
//! page, so rendering can show a visible placeholder in their place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use serde_json::Value;
use validator::Validate;

use super::media::MediaReference;

/// Known section kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Hero,
    Text,
    Image,
    Gallery,
    Contact,
    Social,
    Blog,
    Map,
}

impl SectionKind {
    /// Parses a stored `type` value, accepting the legacy hyphenated names.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hero" => Some(Self::Hero),
            "text" | "rich-text" | "rich_text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "gallery" => Some(Self::Gallery),
            "contact" | "contact-form" | "contact_form" => Some(Self::Contact),
            "social" | "social-links" | "social_links" => Some(Self::Social),
            "blog" | "blog-excerpt" | "blog_excerpt" => Some(Self::Blog),
            "map" => Some(Self::Map),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hero => "hero",
            Self::Text => "text",
            Self::Image => "image",
            Self::Gallery => "gallery",
            Self::Contact => "contact",
            Self::Social => "social",
            Self::Blog => "blog",
            Self::Map => "map",
        }
    }
}

/// Reference to an image inside section data.
///
/// Accepts a bare media id (`12`), a URL string, or an object with `id`,
/// `url` and `alt`. `media` is filled in by the content resolver.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "ImageSlotRepr")]
pub struct ImageSlot {
    pub id: Option<i64>,
    pub url: Option<String>,
    pub alt: Option<String>,
    pub media: Option<MediaReference>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ImageSlotRepr {
    Id(i64),
    Url(String),
    Full {
        id: Option<i64>,
        url: Option<String>,
        alt: Option<String>,
    },
}

impl From<ImageSlotRepr> for ImageSlot {
    fn from(repr: ImageSlotRepr) -> Self {
        let (id, url, alt) = match repr {
            ImageSlotRepr::Id(id) => (Some(id), None, None),
            ImageSlotRepr::Url(url) => (None, Some(url), None),
            ImageSlotRepr::Full { id, url, alt } => (id, url, alt),
        };
        Self {
            id,
            url,
            alt,
            media: None,
        }
    }
}

impl ImageSlot {
    /// Human-readable identification of this slot for diagnostics.
    pub fn describe(&self) -> String {
        match (&self.id, &self.url) {
            (Some(id), _) => format!("media #{id}"),
            (None, Some(url)) => format!("url {url}"),
            (None, None) => "empty image reference".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
pub struct HeroData {
    #[validate(length(min = 1, max = 200, message = "hero title must be 1-200 characters"))]
    pub title: String,
    pub subtitle: Option<String>,
    #[serde(alias = "backgroundImage", alias = "background_image")]
    pub background: Option<ImageSlot>,
    #[serde(alias = "ctaLabel")]
    pub cta_label: Option<String>,
    #[serde(alias = "ctaHref", alias = "cta_url")]
    pub cta_href: Option<String>,
    pub align: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
pub struct TextData {
    pub heading: Option<String>,
    #[validate(length(min = 1, message = "text body must not be empty"))]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
pub struct ImageData {
    pub image: ImageSlot,
    pub caption: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub width: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
pub struct GalleryData {
    pub title: Option<String>,
    #[serde(default)]
    pub images: Vec<ImageSlot>,
    pub layout: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub columns: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
pub struct ContactData {
    pub heading: Option<String>,
    #[validate(email(message = "contact email is not a valid address"))]
    pub email: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(alias = "submitLabel")]
    pub submit_label: Option<String>,
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SocialLink {
    pub platform: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
pub struct SocialData {
    pub heading: Option<String>,
    #[serde(default)]
    pub links: Vec<SocialLink>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BlogExcerpt {
    pub title: String,
    #[serde(default)]
    pub excerpt: String,
    pub url: Option<String>,
    #[serde(alias = "publishedAt")]
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
pub struct BlogData {
    pub heading: Option<String>,
    #[serde(default)]
    pub posts: Vec<BlogExcerpt>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
pub struct MapData {
    pub address: Option<String>,
    #[validate(range(min = -90.0, max = 90.0, message = "latitude out of range"))]
    pub lat: f64,
    #[validate(range(min = -180.0, max = 180.0, message = "longitude out of range"))]
    pub lng: f64,
    #[serde(default, deserialize_with = "lenient_int")]
    pub zoom: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub height: Option<i64>,
}

/// One block of page content.
#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    Hero(HeroData),
    Text(TextData),
    Image(ImageData),
    Gallery(GalleryData),
    Contact(ContactData),
    Social(SocialData),
    Blog(BlogData),
    Map(MapData),
    /// A `type` this build does not know how to render.
    Unknown { kind: String },
    /// A known `type` whose `data` failed to parse or validate.
    Malformed { kind: String, reason: String },
}

impl Section {
    /// Parses one stored `{type, data}` record. Never fails.
    pub fn parse(raw: &Value) -> Self {
        let Some(record) = raw.as_object() else {
            return Self::Malformed {
                kind: "section".to_string(),
                reason: "section entry must be an object".to_string(),
            };
        };

        let Some(type_name) = record.get("type").and_then(Value::as_str) else {
            return Self::Malformed {
                kind: "section".to_string(),
                reason: "section is missing a string `type`".to_string(),
            };
        };

        let Some(kind) = SectionKind::parse(type_name) else {
            return Self::Unknown {
                kind: type_name.to_string(),
            };
        };

        let data = match record.get("data") {
            Some(Value::Null) | None => Value::Object(Default::default()),
            Some(data) => data.clone(),
        };

        let parsed = match kind {
            SectionKind::Hero => typed(data).map(Self::Hero),
            SectionKind::Text => typed(data).map(Self::Text),
            SectionKind::Image => typed(data).map(Self::Image),
            SectionKind::Gallery => typed(data).map(Self::Gallery),
            SectionKind::Contact => typed(data).map(Self::Contact),
            SectionKind::Social => typed(data).map(Self::Social),
            SectionKind::Blog => typed(data).map(Self::Blog),
            SectionKind::Map => typed(data).map(Self::Map),
        };

        parsed.unwrap_or_else(|reason| Self::Malformed {
            kind: kind.as_str().to_string(),
            reason,
        })
    }

    /// Label used in markup and diagnostics.
    pub fn kind_label(&self) -> &str {
        match self {
            Self::Hero(_) => "hero",
            Self::Text(_) => "text",
            Self::Image(_) => "image",
            Self::Gallery(_) => "gallery",
            Self::Contact(_) => "contact",
            Self::Social(_) => "social",
            Self::Blog(_) => "blog",
            Self::Map(_) => "map",
            Self::Unknown { kind } | Self::Malformed { kind, .. } => kind.as_str(),
        }
    }

    /// Media ids referenced by this section.
    pub fn media_ids(&self) -> Vec<i64> {
        let mut ids = Vec::new();
        self.for_each_slot(|slot| {
            if let Some(id) = slot.id {
                ids.push(id);
            }
        });
        ids
    }

    /// Fills every image slot with the reference returned by `resolve`.
    pub fn attach_media<F>(&mut self, mut resolve: F)
    where
        F: FnMut(&ImageSlot) -> Option<MediaReference>,
    {
        let slots: Vec<&mut ImageSlot> = match self {
            Self::Hero(data) => data.background.iter_mut().collect(),
            Self::Image(data) => vec![&mut data.image],
            Self::Gallery(data) => data.images.iter_mut().collect(),
            _ => Vec::new(),
        };
        for slot in slots {
            let media = resolve(&*slot);
            slot.media = media;
        }
    }

    fn for_each_slot<F: FnMut(&ImageSlot)>(&self, mut f: F) {
        match self {
            Self::Hero(data) => data.background.iter().for_each(&mut f),
            Self::Image(data) => f(&data.image),
            Self::Gallery(data) => data.images.iter().for_each(&mut f),
            _ => {}
        }
    }
}

/// Parses a page's stored content into sections.
///
/// Accepts a JSON array, a `{"sections": [...]}` wrapper, or a string holding
/// either. Returns an error only when no section list can be found at all;
/// individual bad records are kept as placeholder variants.
pub fn parse_section_list(content: &Value) -> Result<Vec<Section>, String> {
    match content {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items.iter().map(Section::parse).collect()),
        Value::Object(map) => match map.get("sections") {
            Some(inner @ Value::Array(_)) => parse_section_list(inner),
            _ => Err("expected a list of sections, found an object".to_string()),
        },
        Value::String(text) => {
            let inner: Value = serde_json::from_str(text)
                .map_err(|e| format!("stored content is not valid JSON: {e}"))?;
            if inner.is_string() {
                return Err("stored content is doubly encoded text".to_string());
            }
            parse_section_list(&inner)
        }
        Value::Bool(_) | Value::Number(_) => {
            Err("expected a list of sections, found a scalar".to_string())
        }
    }
}

fn typed<T>(data: Value) -> Result<T, String>
where
    T: DeserializeOwned + Validate,
{
    let parsed: T = serde_json::from_value(data).map_err(|e| e.to_string())?;
    parsed.validate().map_err(|e| e.to_string())?;
    Ok(parsed)
}

/// Accepts integers, floats and numeric strings; anything else is treated as absent
/// so the renderer can fall back to its default.
fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_hero() {
        let section = Section::parse(&json!({
            "type": "hero",
            "data": { "title": "Welcome", "ctaLabel": "Book", "ctaHref": "/contact/" }
        }));

        let Section::Hero(hero) = section else {
            panic!("expected hero");
        };
        assert_eq!(hero.title, "Welcome");
        assert_eq!(hero.cta_label.as_deref(), Some("Book"));
        assert_eq!(hero.cta_href.as_deref(), Some("/contact/"));
    }

    #[test]
    fn test_parse_unknown_type() {
        let section = Section::parse(&json!({ "type": "carousel3d", "data": {} }));
        assert_eq!(
            section,
            Section::Unknown {
                kind: "carousel3d".to_string()
            }
        );
    }

    #[test]
    fn test_parse_legacy_aliases() {
        let section = Section::parse(&json!({
            "type": "contact-form",
            "data": { "email": "hello@example.test" }
        }));
        assert!(matches!(section, Section::Contact(_)));

        let section = Section::parse(&json!({ "type": "Social-Links", "data": { "links": [] } }));
        assert!(matches!(section, Section::Social(_)));
    }

    #[test]
    fn test_parse_malformed_known_type() {
        let section = Section::parse(&json!({ "type": "hero", "data": { "subtitle": "no title" } }));
        match section {
            Section::Malformed { kind, reason } => {
                assert_eq!(kind, "hero");
                assert!(reason.contains("title"));
            }
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_validation_failure() {
        let section = Section::parse(&json!({
            "type": "map",
            "data": { "lat": 123.0, "lng": 10.0 }
        }));
        assert!(matches!(section, Section::Malformed { ref kind, .. } if kind == "map"));

        let section = Section::parse(&json!({ "type": "text", "data": { "body": "" } }));
        assert!(matches!(section, Section::Malformed { .. }));
    }

    #[test]
    fn test_parse_non_object_entry() {
        assert!(matches!(
            Section::parse(&json!("hero")),
            Section::Malformed { .. }
        ));
        assert!(matches!(
            Section::parse(&json!({ "data": {} })),
            Section::Malformed { .. }
        ));
    }

    #[test]
    fn test_image_slot_shapes() {
        let gallery = Section::parse(&json!({
            "type": "gallery",
            "data": {
                "images": [7, "https://cdn.example.test/a.jpg", { "id": 9, "alt": "Dock" }],
                "columns": "4"
            }
        }));

        let Section::Gallery(data) = &gallery else {
            panic!("expected gallery");
        };
        assert_eq!(data.images.len(), 3);
        assert_eq!(data.images[0].id, Some(7));
        assert_eq!(
            data.images[1].url.as_deref(),
            Some("https://cdn.example.test/a.jpg")
        );
        assert_eq!(data.images[2].alt.as_deref(), Some("Dock"));
        assert_eq!(data.columns, Some(4));
        assert_eq!(gallery.media_ids(), vec![7, 9]);
    }

    #[test]
    fn test_lenient_numbers_never_reject() {
        let section = Section::parse(&json!({
            "type": "gallery",
            "data": { "images": [], "columns": "many", "limit": 2.6 }
        }));
        let Section::Gallery(data) = section else {
            panic!("expected gallery");
        };
        assert_eq!(data.columns, None);
        assert_eq!(data.limit, Some(3));
    }

    #[test]
    fn test_attach_media() {
        let mut section = Section::parse(&json!({
            "type": "gallery",
            "data": { "images": [1, 2] }
        }));

        section.attach_media(|slot| {
            slot.id.filter(|id| *id == 1).map(|id| MediaReference {
                id: Some(id),
                url: format!("https://media.example.test/{id}.jpg"),
                alt: None,
                fallback: false,
            })
        });

        let Section::Gallery(data) = section else {
            panic!("expected gallery");
        };
        assert!(data.images[0].media.is_some());
        assert!(data.images[1].media.is_none());
    }

    #[test]
    fn test_parse_section_list_shapes() {
        assert_eq!(parse_section_list(&Value::Null).unwrap().len(), 0);
        assert_eq!(
            parse_section_list(&json!([{ "type": "text", "data": { "body": "hi" } }]))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            parse_section_list(&json!({ "sections": [{ "type": "map" }] }))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            parse_section_list(&json!(r#"[{"type":"text","data":{"body":"x"}}]"#))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_parse_section_list_rejects_garbage() {
        assert!(parse_section_list(&json!("{not json")).is_err());
        assert!(parse_section_list(&json!(42)).is_err());
        assert!(parse_section_list(&json!({ "title": "x" })).is_err());
    }
}
