//! Diagnostics published by the server for rule files.

use std::fmt;

/// Severity level of a diagnostic (LSP numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from the LSP numeric severity. `None` outside 1..=4; callers pick the fallback.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single diagnostic, positioned at its start (0-indexed line and column).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDiagnostic {
    severity: DiagnosticSeverity,
    message: String,
    line: u32,
    col: u32,
    source: String,
}

impl RuleDiagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: impl Into<String>,
        line: u32,
        col: u32,
        source: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            message: message.into(),
            line,
            col,
            source: source.into(),
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    #[must_use]
    pub fn col(&self) -> u32 {
        self.col
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// `line:col: severity: [source] message`, 1-indexed for display.
impl fmt::Display for RuleDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: {}: [{}] {}",
            self.line + 1,
            self.col + 1,
            self.severity.label(),
            self.source,
            self.message
        )
    }
}
