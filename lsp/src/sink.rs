//! Diagnostic sink: the named output channel the supervisor reports into.
//!
//! Server output, installer output and classified failures all end up here.
//! [`OutputChannel`] forwards to `tracing`; [`RecordingSink`] keeps entries in
//! memory so tests and the CLI can inspect what was reported.

use std::sync::{Mutex, PoisonError};

pub trait DiagnosticSink: Send + Sync {
    fn name(&self) -> &str;
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Default sink: one `tracing` event per line, tagged with the channel name.
#[derive(Debug, Clone)]
pub struct OutputChannel {
    name: String,
}

impl OutputChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for OutputChannel {
    fn default() -> Self {
        Self::new("YARA")
    }
}

impl DiagnosticSink for OutputChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self, message: &str) {
        tracing::info!(channel = %self.name, "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(channel = %self.name, "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(channel = %self.name, "{message}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SinkLevel {
    Info,
    Warn,
    Error,
}

/// In-memory sink. Also forwards to `tracing` at debug level.
#[derive(Debug, Default)]
pub struct RecordingSink {
    name: String,
    entries: Mutex<Vec<(SinkLevel, String)>>,
}

impl RecordingSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, level: SinkLevel, message: &str) {
        tracing::debug!(channel = %self.name, ?level, "{message}");
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((level, message.to_string()));
    }

    #[must_use]
    pub fn entries(&self) -> Vec<(SinkLevel, String)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether any entry at `level` contains `needle`.
    #[must_use]
    pub fn contains(&self, level: SinkLevel, needle: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }
}

impl DiagnosticSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self, message: &str) {
        self.record(SinkLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.record(SinkLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.record(SinkLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_keeps_order_and_levels() {
        let sink = RecordingSink::new("YARA");
        sink.info("serving on 127.0.0.1:4000");
        sink.warn("slow start");
        sink.error("bind-timeout");

        assert_eq!(sink.name(), "YARA");
        assert_eq!(
            sink.entries(),
            vec![
                (SinkLevel::Info, "serving on 127.0.0.1:4000".to_string()),
                (SinkLevel::Warn, "slow start".to_string()),
                (SinkLevel::Error, "bind-timeout".to_string()),
            ]
        );
        assert!(sink.contains(SinkLevel::Error, "bind"));
        assert!(!sink.contains(SinkLevel::Info, "bind"));
    }

    #[test]
    fn output_channel_default_name() {
        assert_eq!(OutputChannel::default().name(), "YARA");
    }
}
