pub use anyhow::Result;

use ariadne::{Cache, Config, Label, Report, ReportKind, Source};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::ops::{Add, Range};

#[derive(Clone, PartialEq, Eq, Copy, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// The classification a raised error carries at runtime.
///
/// These double as language-level exception types: `try`/`catch` matches on
/// them, and `new ValueError(...)` constructs a throwable value of one.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum ErrorKind {
    #[strum(to_string = "SyntaxError")]
    Syntax,
    #[strum(to_string = "TypeError")]
    Type,
    #[strum(to_string = "ValueError")]
    Value,
    #[strum(to_string = "NameNotFound")]
    NameNotFound,
    #[strum(to_string = "AttributeError")]
    Attribute,
    #[strum(to_string = "JoinError")]
    Join,
    #[strum(to_string = "CompileError")]
    Compile,
    #[strum(to_string = "CodeError")]
    Code,
    #[strum(to_string = "DatabaseQueryError")]
    DatabaseQuery,
    #[strum(to_string = "DatabaseConnectError")]
    DatabaseConnect,
    #[strum(to_string = "NotImplementedError")]
    NotImplemented,
    #[strum(to_string = "InsufficientAccessLevel")]
    InsufficientAccess,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub reason: String,
    pub span: Option<Span>,
    pub help: Option<String>,
    /// Call sites active when the error was raised, innermost last.
    pub stack: Vec<String>,
}

impl Error {
    pub fn new<S: Into<String>>(kind: ErrorKind, reason: S) -> Self {
        Error {
            kind,
            reason: reason.into(),
            span: None,
            help: None,
            stack: Vec::new(),
        }
    }

    pub fn with_help<S: Into<String>>(mut self, help: S) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_span(mut self, span: Option<Span>) -> Self {
        self.span = span;
        self
    }
}

// Needed for anyhow
impl StdError for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// Location within the source file.
/// Tuples contain:
/// - line number (0-based),
/// - column number within that line (0-based),
#[derive(Debug, Clone, Serialize)]
pub struct SourceLocation {
    pub start: (usize, usize),

    pub end: (usize, usize),
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    pub kind: ErrorKind,
    /// Plain text of the error
    pub reason: String,
    /// A list of suggestions of how to fix the error
    pub hint: Option<String>,
    /// Character offset of error origin within a source file
    pub span: Option<Span>,

    /// Annotated code, containing cause and hints.
    pub display: Option<String>,
    /// Line and column number of error origin within a source file
    pub location: Option<SourceLocation>,
    /// Call sites active when the error was raised, innermost last.
    pub stack: Vec<String>,
}

impl Display for ErrorMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // https://github.com/zesterer/ariadne/issues/52
        if let Some(display) = &self.display {
            let message_without_trailing_spaces = display
                .split('\n')
                .map(str::trim_end)
                .collect::<Vec<_>>()
                .join("\n");
            f.write_str(&message_without_trailing_spaces)?;
        } else {
            write!(f, "{}: {}", self.kind, self.reason)?;
        }
        for frame in self.stack.iter().rev() {
            write!(f, "\n  in {frame}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessages {
    pub inner: Vec<ErrorMessage>,
}

impl From<ErrorMessage> for ErrorMessages {
    fn from(e: ErrorMessage) -> Self {
        ErrorMessages { inner: vec![e] }
    }
}

impl Display for ErrorMessages {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for e in &self.inner {
            Display::fmt(&e, f)?;
        }
        Ok(())
    }
}

/// Converts any error that crossed an `anyhow` boundary back into displayable
/// messages. Errors raised by the interpreter round-trip losslessly; foreign
/// errors degrade to their `Debug` rendering.
pub fn downcast(error: anyhow::Error) -> ErrorMessages {
    let error = match error.downcast::<ErrorMessages>() {
        Ok(messages) => return messages,
        Err(error) => error,
    };

    let message = match error.downcast::<Error>() {
        Ok(error) => ErrorMessage {
            kind: error.kind,
            reason: error.reason,
            hint: error.help,
            span: error.span,
            display: None,
            location: None,
            stack: error.stack,
        },
        Err(error) => ErrorMessage {
            kind: ErrorKind::Compile,
            reason: format!("{:#?}", error),
            hint: None,
            span: None,
            display: None,
            location: None,
            stack: Vec::new(),
        },
    };
    message.into()
}

impl StdError for ErrorMessages {}

impl ErrorMessages {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap()
    }

    /// Computes message location and builds the pretty display.
    pub fn composed(mut self, source_id: &str, source: &str, color: bool) -> Self {
        for e in &mut self.inner {
            let source = Source::from(source);
            let cache = (source_id, source);

            e.location = e.compose_location(&cache.1);
            e.display = e.compose_display(source_id, cache, color);
        }
        self
    }
}

impl ErrorMessage {
    fn compose_display<'a, C>(&self, source_id: &'a str, cache: C, color: bool) -> Option<String>
    where
        C: Cache<&'a str>,
    {
        let config = Config::default().with_color(color);

        let span = Range::from(self.span?);

        let mut report = Report::build(ReportKind::Error, source_id, span.start)
            .with_config(config)
            .with_message(format!("{}", self.kind))
            .with_label(Label::new((source_id, span)).with_message(&self.reason));

        if let Some(hint) = &self.hint {
            report.set_help(hint);
        }

        let mut out = Vec::new();
        report.finish().write(cache, &mut out).ok()?;
        String::from_utf8(out).ok()
    }

    fn compose_location(&self, source: &Source) -> Option<SourceLocation> {
        let span = self.span?;

        let start = source.get_offset_line(span.start)?;
        let end = source.get_offset_line(span.end)?;
        Some(SourceLocation {
            start: (start.1, start.2),
            end: (end.1, end.2),
        })
    }
}

impl From<Span> for Range<usize> {
    fn from(a: Span) -> Self {
        a.start..a.end
    }
}

impl Add<Span> for Span {
    type Output = Span;

    fn add(self, rhs: Span) -> Span {
        Span {
            start: self.start.min(rhs.start),
            end: self.end.max(rhs.end),
        }
    }
}

impl Debug for Span {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "span-chars-{}-{}", self.start, self.end)
    }
}

pub trait WithErrorInfo {
    fn with_help<S: Into<String>>(self, help: S) -> Self;

    fn with_span(self, span: Option<Span>) -> Self;
}

impl<T> WithErrorInfo for Result<T, Error> {
    fn with_help<S: Into<String>>(self, help: S) -> Self {
        self.map_err(|e| e.with_help(help))
    }

    fn with_span(self, span: Option<Span>) -> Self {
        self.map_err(|e| e.with_span(span))
    }
}

/// Attaches `span` to an error crossing an `anyhow` boundary, unless the
/// error already carries one.
pub fn with_span_fallback(error: anyhow::Error, span: Option<Span>) -> anyhow::Error {
    match error.downcast::<Error>() {
        Ok(mut e) => {
            if e.span.is_none() {
                e.span = span;
            }
            e.into()
        }
        Err(e) => e,
    }
}

/// The [ErrorKind] of an error crossing an `anyhow` boundary, if it is ours.
pub fn kind_of(error: &anyhow::Error) -> Option<ErrorKind> {
    error.downcast_ref::<Error>().map(|e| e.kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn kind_display_round_trips() {
        assert_eq!(ErrorKind::Type.to_string(), "TypeError");
        assert_eq!(ErrorKind::from_str("ValueError").unwrap(), ErrorKind::Value);
        assert!(ErrorKind::from_str("NoSuchError").is_err());
    }

    #[test]
    fn downcast_round_trips_our_errors() {
        let e = Error::new(ErrorKind::NameNotFound, "name not found: 'x'")
            .with_span(Some(Span { start: 3, end: 4 }));
        let messages = downcast(anyhow::Error::from(e));
        let only = &messages.inner[0];
        assert_eq!(only.kind, ErrorKind::NameNotFound);
        assert_eq!(only.span, Some(Span { start: 3, end: 4 }));
    }

    #[test]
    fn composed_display_points_at_source() {
        let e = Error::new(ErrorKind::Type, "selection expected bool, got string")
            .with_span(Some(Span { start: 8, end: 14 }));
        let composed = downcast(anyhow::Error::from(e)).composed("", "users[\"name\"]{name}", false);
        let display = composed.inner[0].display.as_deref().unwrap();
        assert!(display.contains("selection expected bool"));
    }
}
