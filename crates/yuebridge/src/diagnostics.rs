//! Mapping worker messages onto editor diagnostics.
//!
//! Worker positions are 1-based inclusive line/column; the diagnostics
//! surface is 0-based. Mapping is a pure function of the reply plus the
//! source text the request carried, so it stays trivially testable.

use async_trait::async_trait;

use crate::bridge::protocol::CheckReply;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Zero-based line and character offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub range: Range,
}

/// Where mapped diagnostics land. Implemented by the editor integration;
/// tests substitute a recording sink.
#[async_trait]
pub trait DiagnosticsSink: Send + Sync {
    async fn set_diagnostics(&self, uri: &str, diagnostics: Vec<Diagnostic>);
    async fn clear_diagnostics(&self, uri: &str);

    /// One-time user-visible failure notice. Optional for sinks that have
    /// nowhere to put it.
    async fn notify_error(&self, _message: &str) {}
}

/// Translate one worker reply into diagnostics for the checked document.
///
/// `"global"` messages carry just the variable name and become warnings
/// with a spelled-out message; every other kind is an error verbatim.
/// When the reported position starts an identifier in `source`, the
/// diagnostic spans that identifier; otherwise it spans a single column.
pub fn map_reply(reply: &CheckReply, source: &str) -> Vec<Diagnostic> {
    reply
        .messages
        .iter()
        .map(|msg| {
            // Some checker payloads are off by one in the other direction.
            let line = msg.line().max(1) as u32 - 1;
            let col = msg.col().max(1) as u32 - 1;

            let (severity, message) = if msg.kind() == "global" {
                (
                    Severity::Warning,
                    format!("use of undeclared global variable '{}'", msg.text()),
                )
            } else {
                (Severity::Error, msg.text().to_string())
            };

            let end_col = token_end(source, line as usize, col as usize)
                .map(|end| end as u32)
                .unwrap_or(col + 1);

            Diagnostic {
                severity,
                message,
                range: Range::new(Position::new(line, col), Position::new(line, end_col)),
            }
        })
        .collect()
}

/// End column of the identifier starting at `(line, col)` in `source`,
/// if there is one. Columns count characters, not bytes.
fn token_end(source: &str, line: usize, col: usize) -> Option<usize> {
    let text = source.lines().nth(line)?;
    let chars: Vec<char> = text.chars().collect();
    if col >= chars.len() || !is_identifier_char(chars[col]) {
        return None;
    }
    let mut end = col + 1;
    while end < chars.len() && is_identifier_char(chars[end]) {
        end += 1;
    }
    Some(end)
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
