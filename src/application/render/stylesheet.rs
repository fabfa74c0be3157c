//! Site stylesheet generated from validated theme tokens.

use askama::Template;

use super::sections::GALLERY_COLUMNS;
use crate::domain::entities::SiteTheme;

#[derive(Template)]
#[template(path = "styles.css", escape = "none")]
struct StylesheetTemplate<'a> {
    theme: &'a SiteTheme,
    gallery_columns: i64,
}

/// Renders the stylesheet shared by every page of a site.
pub fn stylesheet(theme: &SiteTheme) -> Result<String, askama::Error> {
    let (min, max) = GALLERY_COLUMNS;
    StylesheetTemplate {
        theme,
        gallery_columns: theme.gallery_columns.clamp(min, max),
    }
    .render()
}
