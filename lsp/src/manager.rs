//! SessionManager: the one object an activation scope owns.
//!
//! Holds at most one [`Session`]. Starting or restarting always disposes the
//! current session first, so its port lease is back in the shared registry
//! before the next endpoint is allocated.

use std::sync::Arc;

use yls_types::SupervisorSettings;

use crate::session::{Session, SessionError};
use crate::sink::DiagnosticSink;
use crate::transport::PortRegistry;

pub struct SessionManager {
    settings: SupervisorSettings,
    sink: Arc<dyn DiagnosticSink>,
    registry: PortRegistry,
    current: Option<Session>,
}

impl SessionManager {
    #[must_use]
    pub fn new(settings: SupervisorSettings, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            settings,
            sink,
            registry: PortRegistry::new(),
            current: None,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<dyn DiagnosticSink> {
        &self.sink
    }

    #[must_use]
    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    /// The most recent session, whatever its state. A failed session stays here
    /// for inspection until the next start or shutdown.
    #[must_use]
    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    /// Whether a document belongs to the sessions this manager runs.
    #[must_use]
    pub fn handles(&self, uri: &str, language_id: &str) -> bool {
        self.settings.documents.matches(uri, language_id)
    }

    /// Dispose the current session (if any), then start a fresh one.
    ///
    /// On failure the new session is kept as [`current`](Self::current) in state
    /// `Failed`.
    pub async fn start(&mut self) -> Result<&Session, SessionError> {
        self.shutdown().await;
        let session = self.current.insert(Session::new(
            self.settings.clone(),
            self.sink.clone(),
            self.registry.clone(),
        ));
        session.start().await?;
        Ok(session)
    }

    pub async fn restart(&mut self) -> Result<&Session, SessionError> {
        if let Some(session) = &self.current {
            tracing::info!(state = %session.state(), "restarting language server session");
        }
        self.start().await
    }

    /// Dispose and forget the current session. No-op without one.
    pub async fn shutdown(&mut self) {
        if let Some(session) = self.current.take() {
            session.dispose().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use yls_types::{FailureKind, SessionState};

    use super::*;
    use crate::sink::{RecordingSink, SinkLevel};

    fn uninstalled_settings(dir: &std::path::Path) -> SupervisorSettings {
        let mut settings = SupervisorSettings::default();
        settings.server.root = dir.to_path_buf();
        settings.provision.auto_install = false;
        settings
    }

    #[test]
    fn handles_local_rule_documents() {
        let manager = SessionManager::new(
            SupervisorSettings::default(),
            Arc::new(RecordingSink::new("YARA")),
        );
        assert!(manager.handles("file:///rules/peek_rules.yara", "yara"));
        assert!(!manager.handles("untitled:Untitled-1", "yara"));
        assert!(!manager.handles("file:///src/lib.rs", "rust"));
    }

    #[tokio::test]
    async fn shutdown_without_session_is_noop() {
        let mut manager = SessionManager::new(
            SupervisorSettings::default(),
            Arc::new(RecordingSink::new("YARA")),
        );
        manager.shutdown().await;
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn failed_start_is_kept_for_inspection() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::new("YARA"));
        let mut manager = SessionManager::new(uninstalled_settings(dir.path()), sink.clone());

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Failed(ref f) if f.kind() == FailureKind::ProvisioningFailed));

        let session = manager.current().unwrap();
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(
            session.failure().map(|f| f.kind()),
            Some(FailureKind::ProvisioningFailed)
        );
        assert!(sink.contains(SinkLevel::Error, "not installed"));
    }

    #[tokio::test]
    async fn restart_replaces_failed_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SessionManager::new(
            uninstalled_settings(dir.path()),
            Arc::new(RecordingSink::new("YARA")),
        );
        assert!(manager.start().await.is_err());
        let mut first = manager.current().unwrap().subscribe();

        assert!(manager.restart().await.is_err());
        // The previous session stays Failed; the new one failed on its own.
        assert_eq!(*first.borrow_and_update(), SessionState::Failed);
        assert_eq!(manager.current().unwrap().state(), SessionState::Failed);

        manager.shutdown().await;
        assert!(manager.current().is_none());
        assert_eq!(manager.registry().leased_count(), 0);
    }
}
