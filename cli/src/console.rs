//! Terminal-facing diagnostic sink.

use std::io::{Write, stderr};

use yls_lsp::sink::DiagnosticSink;

/// Prints every entry to stderr as `[name] message` and mirrors it into the log.
pub(crate) struct ConsoleSink {
    name: String,
    verbose: bool,
}

impl ConsoleSink {
    pub(crate) fn new(name: impl Into<String>, verbose: bool) -> Self {
        Self {
            name: name.into(),
            verbose,
        }
    }

    fn print(&self, level: &str, message: &str) {
        let mut err = stderr().lock();
        let _ = if level.is_empty() {
            writeln!(err, "[{}] {message}", self.name)
        } else {
            writeln!(err, "[{}] {level}: {message}", self.name)
        };
    }
}

impl DiagnosticSink for ConsoleSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self, message: &str) {
        tracing::info!(channel = %self.name, "{message}");
        if self.verbose {
            self.print("", message);
        }
    }

    fn warn(&self, message: &str) {
        tracing::warn!(channel = %self.name, "{message}");
        self.print("warning", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(channel = %self.name, "{message}");
        self.print("error", message);
    }
}
