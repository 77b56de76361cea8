//! The error type shared by every stage of the template pipeline.
//!
//! Lexing, parsing and execution all surface an [`Error`] carrying the
//! template name, the source position, the nearest meaningful token and a
//! `sender` string identifying the origin (`lexer`, `parser`, `execution`,
//! `tag:for`, `filter:escape`, ...).

use std::fmt::Write as _;

use thiserror::Error;

use crate::token::Token;

/// An error produced while compiling or rendering a template.
#[derive(Debug, Error)]
#[error("{}", describe(.sender, .filename, .line, .column, .token, .message))]
pub struct Error {
    /// The template name (origin path, or a synthetic name for strings).
    pub filename: Option<String>,
    /// 1-based source line, when known.
    pub line: Option<usize>,
    /// 1-based source column, when known.
    pub column: Option<usize>,
    /// The nearest meaningful token, when known.
    pub token: Option<Token>,
    /// The component that raised the error (e.g. `parser`, `tag:if`).
    pub sender: String,
    /// The human-readable message.
    pub message: String,
    /// The wrapped cause, if any.
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

fn describe(
    sender: &String,
    filename: &Option<String>,
    line: &Option<usize>,
    column: &Option<usize>,
    token: &Option<Token>,
    message: &String,
) -> String {
    let mut out = String::new();
    let _ = write!(out, "[Error (where: {sender})");
    if let Some(name) = filename {
        let _ = write!(out, " in {name}");
    }
    if let (Some(line), Some(column)) = (line, column) {
        let _ = write!(out, " | Line {line} Col {column}");
        if let Some(token) = token {
            let _ = write!(out, " near '{}'", token.value);
        }
    }
    let _ = write!(out, "] {message}");
    out
}

impl Error {
    /// Creates an error with a sender and message, without position data.
    pub fn new(sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            filename: None,
            line: None,
            column: None,
            token: None,
            sender: sender.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Attaches a token (and its position) if none is present yet.
    #[must_use]
    pub fn with_token(mut self, token: &Token) -> Self {
        self.update_from_token(token);
        self
    }

    /// Attaches the template name if none is present yet.
    #[must_use]
    pub fn with_filename(mut self, name: impl Into<String>) -> Self {
        if self.filename.is_none() {
            self.filename = Some(name.into());
        }
        self
    }

    /// Wraps an underlying cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Fills position data from `token` unless already set.
    pub(crate) fn update_from_token(&mut self, token: &Token) {
        if self.token.is_none() {
            self.token = Some(token.clone());
            self.line = Some(token.line);
            self.column = Some(token.column);
        }
    }
}
