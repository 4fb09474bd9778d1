//! Session controller.
//!
//! A [`Session`] drives one server through provisioning, launch, bind-wait and
//! connect, then supervises it until disposal. All resources (process, endpoint,
//! channel) live behind one async mutex; `start` holds it for the whole startup so
//! `dispose` can only tear down once startup has observed cancellation and
//! returned. Every startup await races the cancel signal.
//!
//! After `Active`, a monitor task watches the process exit event and the channel
//! close event. Either one moves the session to `Failed` and releases resources.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use yls_types::{Failure, FailureKind, SessionState, SupervisorSettings, TransportKind};

use crate::client::{ChannelClosed, ClientHandle, ClientOptions, LanguageClient, ServerEvent};
use crate::failure;
use crate::process::{LaunchSpec, ProcessExit, ServerProcess};
use crate::provision::{Environment, Provisioner};
use crate::sink::DiagnosticSink;
use crate::transport::{Channel, Endpoint, Negotiator, PortRegistry};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Failed(#[from] Failure),
    #[error("session start was cancelled")]
    Cancelled,
    #[error("session cannot be started from state {0}")]
    NotStartable(SessionState),
}

enum StartError {
    Failed(Failure),
    Cancelled,
}

impl From<Failure> for StartError {
    fn from(failure: Failure) -> Self {
        Self::Failed(failure)
    }
}

/// What a live session exposes about its server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub pid: Option<u32>,
    pub transport: TransportKind,
    /// Socket transport only.
    pub host: Option<IpAddr>,
    /// Socket transport only.
    pub port: Option<u16>,
}

#[derive(Default)]
struct Resources {
    process: Option<ServerProcess>,
    endpoint: Option<Endpoint>,
    client: Option<LanguageClient>,
    monitor: Option<JoinHandle<()>>,
}

struct SessionInner {
    settings: SupervisorSettings,
    sink: Arc<dyn DiagnosticSink>,
    registry: PortRegistry,
    state_tx: watch::Sender<SessionState>,
    failure: Mutex<Option<Failure>>,
    cancel_tx: watch::Sender<bool>,
    resources: tokio::sync::Mutex<Resources>,
    handle: Mutex<Option<SessionHandle>>,
    client: Mutex<Option<ClientHandle>>,
    events: Mutex<Option<mpsc::Receiver<ServerEvent>>>,
}

pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    #[must_use]
    pub fn new(
        settings: SupervisorSettings,
        sink: Arc<dyn DiagnosticSink>,
        registry: PortRegistry,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Uninstalled);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SessionInner {
                settings,
                sink,
                registry,
                state_tx,
                failure: Mutex::new(None),
                cancel_tx,
                resources: tokio::sync::Mutex::new(Resources::default()),
                handle: Mutex::new(None),
                client: Mutex::new(None),
                events: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// Observe state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// The classified failure, once the session is `Failed`.
    #[must_use]
    pub fn failure(&self) -> Option<Failure> {
        lock(&self.inner.failure).clone()
    }

    /// `{ pid, host, port }` of the server, while the session is `Active`.
    #[must_use]
    pub fn handle(&self) -> Option<SessionHandle> {
        lock(&self.inner.handle).clone()
    }

    /// Client for the live channel, while the session is `Active`.
    #[must_use]
    pub fn client(&self) -> Option<ClientHandle> {
        lock(&self.inner.client).clone()
    }

    /// Server events (diagnostics, channel close). Can be taken once per session.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        lock(&self.inner.events).take()
    }

    #[must_use]
    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Drive the session from `Uninstalled` to `Active`.
    ///
    /// Failures are classified, reported to the sink, and leave the session
    /// `Failed` with every resource released. A concurrent [`dispose`](Self::dispose)
    /// makes this return [`SessionError::Cancelled`].
    pub async fn start(&self) -> Result<(), SessionError> {
        let mut res = self.inner.resources.lock().await;
        let state = self.state();
        if state != SessionState::Uninstalled {
            return Err(SessionError::NotStartable(state));
        }

        match self.inner.run_start(&mut res).await {
            Ok(()) => Ok(()),
            Err(StartError::Failed(failure)) => {
                self.inner.fail(failure.clone());
                self.inner.release(&mut res, true).await;
                Err(SessionError::Failed(failure))
            }
            Err(StartError::Cancelled) => {
                tracing::info!(state = %self.state(), "session start cancelled");
                Err(SessionError::Cancelled)
            }
        }
    }

    /// Tear the session down: close the channel, terminate the server, release the
    /// endpoint. Idempotent. A `Failed` session stays `Failed`; every other state
    /// ends in `Stopped`.
    pub async fn dispose(&self) {
        self.inner.cancel_tx.send_replace(true);
        let mut res = self.inner.resources.lock().await;

        let state = self.state();
        if state.is_terminal() {
            self.inner.release(&mut res, true).await;
            return;
        }

        self.inner.transition(SessionState::Stopping);
        if state == SessionState::Active
            && let Some(client) = res.client.as_ref()
        {
            let grace = self.inner.settings.lifecycle.terminate_grace();
            match tokio::time::timeout(grace, client.handle().shutdown()).await {
                Ok(Ok(())) => tracing::debug!("server acknowledged shutdown"),
                Ok(Err(e)) => tracing::debug!("shutdown handshake failed: {e}"),
                Err(_) => tracing::debug!("shutdown handshake timed out"),
            }
        }
        self.inner.release(&mut res, true).await;
        self.inner.transition(SessionState::Stopped);
        self.inner.sink.info("YARA language server stopped");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Unwind any start still racing the signal; dropping the resources kills the server.
        self.inner.cancel_tx.send_replace(true);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("handle", &self.handle())
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut from = None;
        let changed = self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                from = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        match from {
            Some(from) => tracing::debug!(%from, to = %next, "session state"),
            None => tracing::debug!(state = %self.state(), to = %next, "transition refused"),
        }
        changed
    }

    fn advance(&self, next: SessionState) -> Result<(), StartError> {
        if self.transition(next) {
            Ok(())
        } else {
            Err(StartError::Cancelled)
        }
    }

    /// Record the failure and move to `Failed`. False if the session is already terminal.
    fn fail(&self, failure: Failure) -> bool {
        let mut slot = lock(&self.failure);
        let changed = self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(SessionState::Failed) {
                *state = SessionState::Failed;
                true
            } else {
                false
            }
        });
        if changed {
            failure::report(self.sink.as_ref(), &failure);
            *slot = Some(failure);
        }
        changed
    }

    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, StartError> {
        let mut cancel_rx = self.cancel_tx.subscribe();
        tokio::select! {
            biased;
            () = cancelled(&mut cancel_rx) => Err(StartError::Cancelled),
            out = fut => Ok(out),
        }
    }

    async fn run_start(self: &Arc<Self>, res: &mut Resources) -> Result<(), StartError> {
        let settings = &self.settings;
        let env_dir = settings.server.env_dir();

        self.advance(SessionState::Installing)?;
        let provisioner = Provisioner::new(settings.provision.clone(), self.sink.clone());
        // A zero installer exit is not proof; the package listing decides.
        let installed = if settings.provision.auto_install {
            self.cancellable(provisioner.ensure_installed(&settings.server.root, &env_dir))
                .await?
                && self.cancellable(provisioner.is_installed(&env_dir)).await?
        } else {
            self.cancellable(provisioner.is_installed(&env_dir)).await?
        };
        if !installed {
            return Err(failure::provisioning(&env_dir, settings.provision.auto_install).into());
        }
        self.advance(SessionState::Installed)?;

        self.advance(SessionState::Launching)?;
        let negotiator =
            Negotiator::with_registry(settings.transport.clone(), self.registry.clone());
        let endpoint = negotiator
            .allocate_endpoint()
            .map_err(|e| failure::allocate(&e))?;
        if endpoint.is_occupied() {
            return Err(failure::occupied(&endpoint).into());
        }

        let runtime = settings
            .server
            .runtime_override()
            .unwrap_or_else(|| Environment::new(&env_dir).runtime_executable());
        let mut args = vec![settings.server.entrypoint().into_os_string()];
        args.extend(endpoint.launch_args());
        let spec = LaunchSpec {
            program: runtime,
            args,
            cwd: settings.server.working_dir(),
            stdio_channel: endpoint.kind() == TransportKind::Stdio,
        };
        let endpoint: &Endpoint = res.endpoint.insert(endpoint);
        let process = res.process.insert(
            ServerProcess::spawn(spec, self.sink.clone()).map_err(|e| failure::spawn(&e))?,
        );
        let stdio = process.take_stdio();

        self.advance(SessionState::AwaitingBind)?;
        let bind_timeout = settings.transport.bind_timeout();
        let mut exit_rx = process.subscribe_exit();
        let ready = self
            .cancellable(async {
                tokio::select! {
                    ready = negotiator.await_ready(endpoint, bind_timeout) => ready,
                    exit = exited(&mut exit_rx) => {
                        // Nothing will ever bind; let the connect attempt classify it.
                        tracing::debug!(exit = ?exit, "server exited during bind wait");
                        true
                    }
                }
            })
            .await?;
        if !ready {
            return Err(failure::bind_timeout(endpoint, bind_timeout).into());
        }

        self.advance(SessionState::Connecting)?;
        let channel = match stdio {
            Some(pipes) => {
                if let Some(exit) = process.exit_status() {
                    return Err(Failure::new(
                        FailureKind::ConnectionRefused,
                        SessionState::Connecting,
                        format!("server exited with {exit} before the channel was established"),
                    )
                    .into());
                }
                Channel::from_stdio(pipes)
            }
            None => self
                .cancellable(negotiator.connect(endpoint))
                .await?
                .map_err(|e| failure::connect(&e))?,
        };

        let options = ClientOptions {
            language_id: settings.documents.language_id.clone(),
            request_timeout: settings.lifecycle.request_timeout(),
        };
        let (client, events) = LanguageClient::start(channel, options, self.sink.clone());
        let handle = SessionHandle {
            pid: process.pid(),
            transport: endpoint.kind(),
            host: endpoint.host(),
            port: endpoint.port(),
        };
        let closed_rx = client.closed();
        let exit_rx = process.subscribe_exit();
        *lock(&self.client) = Some(client.handle());
        *lock(&self.events) = Some(events);
        *lock(&self.handle) = Some(handle);
        res.client = Some(client);

        self.advance(SessionState::Active)?;
        // A process that already exited is still visible through the watch value.
        res.monitor = Some(self.spawn_monitor(exit_rx, closed_rx));
        self.sink.info(&format!(
            "YARA language server is running (pid {}, {})",
            process
                .pid()
                .map_or_else(|| String::from("?"), |p| p.to_string()),
            endpoint
        ));
        Ok(())
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        mut exit_rx: watch::Receiver<Option<ProcessExit>>,
        mut closed_rx: watch::Receiver<Option<ChannelClosed>>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let poll = self.settings.transport.poll_interval();
        tokio::spawn(async move {
            let failure = tokio::select! {
                exit = exited(&mut exit_rx) => match exit {
                    Some(exit) => failure::process_exit(exit),
                    None => return,
                },
                closed = channel_closed(&mut closed_rx) => {
                    let Some(closed) = closed else { return };
                    // Attribute the loss to an exit seen within one polling interval.
                    let exit = tokio::time::timeout(poll, exited(&mut exit_rx))
                        .await
                        .ok()
                        .flatten();
                    failure::channel_loss(&closed, exit)
                }
            };
            let Some(inner) = weak.upgrade() else { return };
            inner.on_active_failure(failure).await;
        })
    }

    async fn on_active_failure(&self, failure: Failure) {
        if *self.cancel_tx.borrow() {
            tracing::debug!("ignoring {} during disposal", failure.kind());
            return;
        }
        if !self.fail(failure) {
            return;
        }
        let mut res = self.resources.lock().await;
        self.release(&mut res, false).await;
    }

    /// Close the channel, terminate the process, release the endpoint. Safe to repeat.
    async fn release(&self, res: &mut Resources, abort_monitor: bool) {
        if let Some(monitor) = res.monitor.take()
            && abort_monitor
        {
            monitor.abort();
        }
        lock(&self.client).take();
        lock(&self.handle).take();

        if let Some(client) = res.client.take() {
            client.close().await;
        }
        if let Some(mut process) = res.process.take() {
            let grace = self.settings.lifecycle.terminate_grace();
            if let Some(exit) = process.terminate(grace).await {
                tracing::debug!(%exit, "server process released");
            }
        }
        if let Some(endpoint) = res.endpoint.take() {
            remove_ipc_socket(&endpoint);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        // Sender gone: the session itself is gone, so nothing can cancel.
        std::future::pending::<()>().await;
    }
}

async fn exited(rx: &mut watch::Receiver<Option<ProcessExit>>) -> Option<ProcessExit> {
    rx.wait_for(Option::is_some).await.ok().and_then(|exit| *exit)
}

async fn channel_closed(rx: &mut watch::Receiver<Option<ChannelClosed>>) -> Option<ChannelClosed> {
    rx.wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|closed| closed.clone())
}

#[cfg(unix)]
fn remove_ipc_socket(endpoint: &Endpoint) {
    if let Endpoint::Ipc { path } = endpoint
        && path.exists()
        && let Err(e) = std::fs::remove_file(path)
    {
        tracing::debug!(path = %path.display(), "removing ipc socket failed: {e}");
    }
}

#[cfg(not(unix))]
fn remove_ipc_socket(_endpoint: &Endpoint) {}

/// Bounded wait used by callers that need a settled state.
pub async fn wait_for_state(
    rx: &mut watch::Receiver<SessionState>,
    timeout: Duration,
    predicate: impl FnMut(&SessionState) -> bool,
) -> Option<SessionState> {
    match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
        Ok(Ok(state)) => Some(*state),
        Ok(Err(_)) | Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{RecordingSink, SinkLevel};

    fn session(root: &std::path::Path) -> (Session, Arc<RecordingSink>) {
        let mut settings = SupervisorSettings::default();
        settings.server.root = root.to_path_buf();
        settings.provision.auto_install = false;
        let sink = Arc::new(RecordingSink::new("YARA"));
        (
            Session::new(settings, sink.clone(), PortRegistry::new()),
            sink,
        )
    }

    #[tokio::test]
    async fn dispose_before_start_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (session, sink) = session(dir.path());
        assert_eq!(session.state(), SessionState::Uninstalled);
        assert!(session.handle().is_none());

        session.dispose().await;
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(matches!(
            session.start().await,
            Err(SessionError::NotStartable(SessionState::Stopped))
        ));
        assert!(sink.contains(SinkLevel::Info, "stopped"));
    }

    #[tokio::test]
    async fn failed_start_records_failure_and_stays_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _sink) = session(dir.path());
        let mut states = session.subscribe();

        let err = session.start().await.unwrap_err();
        let SessionError::Failed(failure) = err else {
            panic!("expected a classified failure");
        };
        assert_eq!(failure.kind(), FailureKind::ProvisioningFailed);
        assert_eq!(failure.state(), SessionState::Installing);
        assert_eq!(*states.borrow_and_update(), SessionState::Failed);
        assert_eq!(session.failure(), Some(failure));

        session.dispose().await;
        session.dispose().await;
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn wait_for_state_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _sink) = session(dir.path());
        let mut states = session.subscribe();
        let state = wait_for_state(&mut states, Duration::from_millis(20), |s| {
            *s == SessionState::Active
        })
        .await;
        assert_eq!(state, None);
    }
}
