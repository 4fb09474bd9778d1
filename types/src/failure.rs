//! Failure taxonomy surfaced by the session supervisor.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::SessionState;

/// Classified reason a session attempt or a live session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    ProvisioningFailed,
    LaunchFailed,
    BindTimeout,
    ConnectionRefused,
    /// Catch-all for mid-session I/O faults.
    TransportError,
    /// The server terminated while the session was active.
    ProcessExited,
}

impl FailureKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ProvisioningFailed => "provisioning-failed",
            Self::LaunchFailed => "launch-failed",
            Self::BindTimeout => "bind-timeout",
            Self::ConnectionRefused => "connection-refused",
            Self::TransportError => "transport-error",
            Self::ProcessExited => "process-exited",
        }
    }

    /// Short actionable text for the user-facing output channel.
    #[must_use]
    pub fn user_message(self) -> &'static str {
        match self {
            Self::ProvisioningFailed => {
                "The YARA language server is not installed. Run `yls install` and check the \
                 installer output."
            }
            Self::LaunchFailed => {
                "The YARA language server could not be started. Check that the server runtime \
                 exists and is executable."
            }
            Self::BindTimeout => {
                "The YARA language server did not start listening in time. It may have crashed \
                 on start; see the server output above."
            }
            Self::ConnectionRefused => {
                "Connection to the YARA language server was refused. The server is probably not \
                 running; restart the session to try again."
            }
            Self::TransportError => {
                "The connection to the YARA language server failed. Restart the session to \
                 reconnect."
            }
            Self::ProcessExited => {
                "The YARA language server exited unexpectedly. Restart the session to start a \
                 new server."
            }
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A classified failure, tagged with the state the session was in when it happened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} while {state}: {message}")]
pub struct Failure {
    kind: FailureKind,
    message: String,
    state: SessionState,
}

impl Failure {
    #[must_use]
    pub fn new(kind: FailureKind, state: SessionState, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            state,
        }
    }

    #[must_use]
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// State the session was in when the failure was observed.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Message for the diagnostic sink: the actionable hint followed by the detail.
    #[must_use]
    pub fn user_message(&self) -> String {
        format!("{} ({})", self.kind.user_message(), self.message)
    }
}
