//! Compiler error text -> structured diagnostics.
//!
//! The compiler reports failures as a single string:
//!
//! ```text
//! <unknown>:12:5: error: type mismatch
//! let x = 1 + "a"
//!         ^~~
//! ```
//!
//! wrapped in ANSI colour codes. The first line carries the location, the
//! second is the offending source line and the third underlines the span.
//! Anything that does not fit this shape, including a header without the
//! two lines below it, still becomes a `Diagnostic`, just without a
//! `SourceSpan`.

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

use crate::config::DEFAULT_LOCATABLE_MARKER;

/// Where in the source a diagnostic points. Lines and columns are 1-based;
/// `end_column` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub end_column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub span: Option<SourceSpan>,
    /// The full error text with colour codes removed.
    pub text: String,
}

impl Diagnostic {
    /// A diagnostic that cannot be placed in the source.
    pub fn plain(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            message: text.trim().to_string(),
            span: None,
            text,
        }
    }

    pub fn is_located(&self) -> bool {
        self.span.is_some()
    }

    /// Decoration for the editor, if the diagnostic has a location.
    pub fn marker(&self) -> Option<EditorMarker> {
        let span = self.span.as_ref()?;
        Some(EditorMarker {
            start_line_number: span.line,
            start_column: span.column,
            end_line_number: span.line,
            end_column: span.end_column,
            message: self.message.clone(),
            severity: MarkerSeverity::Error,
        })
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.span {
            Some(span) => write!(
                f,
                "{}:{}:{}-{}: {}",
                span.file, span.line, span.column, span.end_column, self.message
            ),
            None => f.write_str(&self.message),
        }
    }
}

/// Line/column-addressed decoration in the shape the editor widget takes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorMarker {
    pub start_line_number: u32,
    pub start_column: u32,
    pub end_line_number: u32,
    pub end_column: u32,
    pub message: String,
    pub severity: MarkerSeverity,
}

/// Editor severities, serialized as the editor's numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerSeverity {
    Hint = 1,
    Info = 2,
    Warning = 4,
    Error = 8,
}

impl Serialize for MarkerSeverity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticParser {
    marker: String,
}

impl Default for DiagnosticParser {
    fn default() -> Self {
        Self::new(DEFAULT_LOCATABLE_MARKER)
    }
}

impl DiagnosticParser {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Parse error text. Never fails: text without a usable location header
    /// comes back as a plain diagnostic.
    pub fn parse(&self, raw: &str) -> Diagnostic {
        let text = strip_ansi(raw);
        match self.locate(&text) {
            Some((span, message)) => Diagnostic {
                message,
                span: Some(span),
                text,
            },
            None => Diagnostic::plain(text),
        }
    }

    fn locate(&self, text: &str) -> Option<(SourceSpan, String)> {
        let mut lines = text.lines();

        let header = lines.next()?.trim_start();
        let rest = header.strip_prefix(self.marker.as_str())?.strip_prefix(':')?;
        let mut fields = rest.splitn(3, ':');
        let line = position(fields.next()?)?;
        let column = position(fields.next()?)?;
        let message = message(fields.next().unwrap_or(""));

        // Second line is the source context; only the underline matters.
        let _context = lines.next()?;
        let end_column = underline_end(lines.next()?, column);

        let span = SourceSpan {
            file: self.marker.clone(),
            line,
            column,
            end_column,
        };
        Some((span, message))
    }
}

fn position(field: &str) -> Option<u32> {
    field.trim().parse::<u32>().ok().filter(|value| *value >= 1)
}

fn message(field: &str) -> String {
    let field = field.trim();
    field
        .strip_prefix("error:")
        .map(str::trim_start)
        .unwrap_or(field)
        .to_string()
}

/// Exclusive 1-based end column of the first underline run.
///
/// The run starts at the first non-space character and ends at the next
/// space, or at the end of the line. A blank underline spans to one past its
/// length. The result is never before `column + 1`.
fn underline_end(underline: &str, column: u32) -> u32 {
    let minimum = column.saturating_add(1);

    let mut first_non_space = None;
    let mut run_end = None;
    let mut len = 0usize;
    for (index, ch) in underline.chars().enumerate() {
        len = index + 1;
        match first_non_space {
            None if ch != ' ' => first_non_space = Some(index),
            Some(_) if ch == ' ' && run_end.is_none() => run_end = Some(index),
            _ => {}
        }
    }

    let end = match (first_non_space, run_end) {
        (Some(_), Some(end)) => end + 1,
        _ => len + 1,
    };
    u32::try_from(end).unwrap_or(u32::MAX).max(minimum)
}

/// Remove ANSI CSI sequences (`ESC [ params final`).
fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if ('@'..='~').contains(&next) {
                    break;
                }
            }
            continue;
        }
        out.push(ch);
    }
    out
}
