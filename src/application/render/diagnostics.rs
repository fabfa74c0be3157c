//! Typed findings reported while rendering.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Content was adjusted but still rendered.
    Warning,
    /// Content could not be rendered and was replaced by a placeholder.
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finding about one section (or the page as a whole).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderDiagnostic {
    pub severity: Severity,
    /// Section type label, or `page` for page-level findings.
    pub section: String,
    /// Position of the section on its page, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub message: String,
}

impl RenderDiagnostic {
    pub fn warning(section: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            section: section.into(),
            index: None,
            message: message.into(),
        }
    }

    pub fn error(section: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            section: section.into(),
            index: None,
            message: message.into(),
        }
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

/// Collects diagnostics for one section render.
#[derive(Debug)]
pub(crate) struct Findings {
    section: &'static str,
    items: Vec<RenderDiagnostic>,
}

impl Findings {
    pub(crate) fn new(section: &'static str) -> Self {
        Self {
            section,
            items: Vec::new(),
        }
    }

    pub(crate) fn warn(&mut self, message: impl Into<String>) {
        self.items
            .push(RenderDiagnostic::warning(self.section, message));
    }

    /// Clamps `value` into `min..=max`, using `default` when absent.
    ///
    /// A present value outside the range is clamped and reported.
    pub(crate) fn clamp(
        &mut self,
        field: &str,
        value: Option<i64>,
        default: i64,
        min: i64,
        max: i64,
    ) -> i64 {
        let Some(value) = value else {
            return default;
        };
        let clamped = value.clamp(min, max);
        if clamped != value {
            self.warn(format!(
                "{field} {value} is outside {min}..={max}; using {clamped}"
            ));
        }
        clamped
    }

    pub(crate) fn into_vec(self) -> Vec<RenderDiagnostic> {
        self.items
    }
}
