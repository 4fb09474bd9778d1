//! Failure classifier: maps low-level errors onto the [`FailureKind`] taxonomy.

use std::path::Path;
use std::time::Duration;

use yls_types::{Failure, FailureKind, SessionState};

use crate::client::ChannelClosed;
use crate::process::{ProcessExit, SpawnError};
use crate::sink::DiagnosticSink;
use crate::transport::{AllocateError, ConnectError, Endpoint};

#[must_use]
pub fn provisioning(target: &Path, auto_install: bool) -> Failure {
    let message = if auto_install {
        format!(
            "installer did not produce a usable environment at {}",
            target.display()
        )
    } else {
        format!(
            "no server environment at {} and automatic install is disabled",
            target.display()
        )
    };
    Failure::new(
        FailureKind::ProvisioningFailed,
        SessionState::Installing,
        message,
    )
}

#[must_use]
pub fn spawn(err: &SpawnError) -> Failure {
    Failure::new(
        FailureKind::LaunchFailed,
        SessionState::Launching,
        err.to_string(),
    )
}

/// Endpoint allocation happens right before launch. An occupied or leased port is a
/// bind failure; anything else is a transport fault.
#[must_use]
pub fn allocate(err: &AllocateError) -> Failure {
    let kind = match err {
        AllocateError::Leased(_) => FailureKind::BindTimeout,
        AllocateError::Exhausted(_) | AllocateError::Probe { .. } => FailureKind::TransportError,
    };
    Failure::new(kind, SessionState::Launching, err.to_string())
}

#[must_use]
pub fn occupied(endpoint: &Endpoint) -> Failure {
    Failure::new(
        FailureKind::BindTimeout,
        SessionState::Launching,
        format!("{endpoint} is already in use by another process"),
    )
}

#[must_use]
pub fn bind_timeout(endpoint: &Endpoint, timeout: Duration) -> Failure {
    Failure::new(
        FailureKind::BindTimeout,
        SessionState::AwaitingBind,
        format!("nothing listening on {endpoint} after {timeout:?}"),
    )
}

/// A refused connection, or a local socket path that does not exist, means the
/// server is not running; every other connect error is a generic transport fault.
#[must_use]
pub fn connect(err: &ConnectError) -> Failure {
    let kind = match err {
        ConnectError::Refused { .. } | ConnectError::NotFound { .. } => {
            FailureKind::ConnectionRefused
        }
        ConnectError::TimedOut { .. }
        | ConnectError::Io { .. }
        | ConnectError::StdioNotConnectable => FailureKind::TransportError,
    };
    Failure::new(kind, SessionState::Connecting, err.to_string())
}

/// The process went away while the session was active.
#[must_use]
pub fn process_exit(exit: ProcessExit) -> Failure {
    Failure::new(
        FailureKind::ProcessExited,
        SessionState::Active,
        format!("server exited with {exit}"),
    )
}

/// The channel broke while the session was active. `exit` is the process status
/// observed within one polling interval of the loss, if any.
#[must_use]
pub fn channel_loss(closed: &ChannelClosed, exit: Option<ProcessExit>) -> Failure {
    match exit {
        Some(exit) => Failure::new(
            FailureKind::ProcessExited,
            SessionState::Active,
            format!("channel {closed}; server exited with {exit}"),
        ),
        None => Failure::new(
            FailureKind::TransportError,
            SessionState::Active,
            format!("channel {closed} while the server is still running"),
        ),
    }
}

/// Report a failure to the sink at error level, with the actionable message.
pub fn report(sink: &dyn DiagnosticSink, failure: &Failure) {
    tracing::error!(
        kind = %failure.kind(),
        state = %failure.state(),
        "session failed: {}",
        failure.message()
    );
    sink.error(&failure.user_message());
}
