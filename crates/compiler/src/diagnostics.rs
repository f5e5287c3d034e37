//! Compilation diagnostics.
//!
//! Phases never raise for control flow: each phase appends to a diagnostic
//! list and returns a best-effort artifact. A diagnostic carries its source
//! location *and* the originating BASIC line (resolved through the line
//! mapping), so messages cite the line the user typed.

use crate::token::SourceLoc;
use std::fmt;

/// What produced the diagnostic, which also implies its severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Malformed source caught by the lexer.
    LexError,
    /// Malformed source caught by the parser.
    SyntaxError,
    /// A validation failure: unknown identifier, arity mismatch, bad EXIT...
    SemanticError,
    /// Non-fatal advice; never stops compilation.
    Warning,
    /// An invariant violation in a later phase - a bug in the compiler, not
    /// in the user's program.
    CompilerBug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl DiagnosticKind {
    pub fn severity(&self) -> Severity {
        match self {
            DiagnosticKind::Warning => Severity::Warning,
            _ => Severity::Error,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            DiagnosticKind::LexError => "lex error",
            DiagnosticKind::SyntaxError => "syntax error",
            DiagnosticKind::SemanticError => "semantic error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::CompilerBug => "compiler bug",
        }
    }
}

/// A single diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub loc: SourceLoc,
    /// Originating BASIC line number, when the source had one.
    pub basic_line: Option<u32>,
    /// Optional fix-it text.
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>, loc: SourceLoc) -> Self {
        Diagnostic {
            kind,
            message: message.into(),
            loc,
            basic_line: None,
            hint: None,
        }
    }

    pub fn with_basic_line(mut self, basic_line: Option<u32>) -> Self {
        self.basic_line = basic_line;
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind.severity() == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.basic_line {
            Some(line) => write!(f, "BASIC line {}: ", line)?,
            None => write!(f, "{}: ", self.loc)?,
        }
        write!(f, "{}: {}", self.kind.label(), self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " ({})", hint)?;
        }
        Ok(())
    }
}

/// Format a diagnostic list for terminal output, one per line.
pub fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    let mut out = String::new();
    for d in diagnostics {
        out.push_str(&format!("  {}\n", d));
    }
    out
}

/// True when the list contains at least one error-severity entry.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefers_basic_line() {
        let d = Diagnostic::new(
            DiagnosticKind::SemanticError,
            "undeclared variable X",
            SourceLoc::new(1, 4),
        )
        .with_basic_line(Some(20));
        assert_eq!(
            d.to_string(),
            "BASIC line 20: semantic error: undeclared variable X"
        );
    }

    #[test]
    fn display_falls_back_to_source_location() {
        let d = Diagnostic::new(DiagnosticKind::LexError, "bad character '@'", SourceLoc::new(2, 0));
        assert_eq!(d.to_string(), "3:1: lex error: bad character '@'");
    }

    #[test]
    fn warnings_are_not_errors() {
        let w = Diagnostic::new(DiagnosticKind::Warning, "unused label", SourceLoc::default());
        let e = Diagnostic::new(DiagnosticKind::CompilerBug, "stack under-run", SourceLoc::default());
        assert!(!w.is_error());
        assert!(e.is_error());
        assert!(has_errors(&[w.clone(), e]));
        assert!(!has_errors(&[w]));
    }

    #[test]
    fn hint_is_appended() {
        let d = Diagnostic::new(DiagnosticKind::SyntaxError, "expected THEN", SourceLoc::default())
            .with_hint("insert THEN after the condition");
        assert!(d.to_string().ends_with("(insert THEN after the condition)"));
    }
}
