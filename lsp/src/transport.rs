//! Transport negotiator: endpoint allocation, readiness polling and the single
//! connection attempt.
//!
//! The transport kind is static configuration. Each [`Endpoint`] variant knows
//! how to be handed to the server (launch arguments), probed and connected.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fmt;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use yls_types::{TransportKind, TransportSettings};

use crate::process::StdioPipes;

/// Probe attempts before giving up on finding an unleased port.
const MAX_PORT_PROBES: usize = 16;

static IPC_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum AllocateError {
    #[error("no unleased port found after {0} probes")]
    Exhausted(usize),
    #[error("port {0} is leased by another session")]
    Leased(u16),
    #[error("probing for a free port on {host}: {source}")]
    Probe {
        host: IpAddr,
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connection to {target} refused")]
    Refused { target: String },
    #[error("nothing listening at {target}")]
    NotFound { target: String },
    #[error("connecting to {target} timed out after {timeout:?}")]
    TimedOut { target: String, timeout: Duration },
    #[error("connecting to {target}: {source}")]
    Io {
        target: String,
        source: std::io::Error,
    },
    #[error("stdio endpoints are connected through the process pipes")]
    StdioNotConnectable,
}

impl ConnectError {
    fn from_io(target: String, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => Self::Refused { target },
            std::io::ErrorKind::NotFound => Self::NotFound { target },
            _ => Self::Io {
                target,
                source: err,
            },
        }
    }
}

/// Ports currently held by live socket endpoints.
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    leased: Arc<Mutex<HashSet<u16>>>,
}

impl PortRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn try_lease(&self, port: u16) -> Option<PortLease> {
        let mut leased = self.leased.lock().unwrap_or_else(PoisonError::into_inner);
        if !leased.insert(port) {
            return None;
        }
        Some(PortLease {
            port,
            registry: self.leased.clone(),
        })
    }

    #[must_use]
    pub fn is_leased(&self, port: u16) -> bool {
        self.leased
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&port)
    }

    #[must_use]
    pub fn leased_count(&self) -> usize {
        self.leased
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A port reserved for one session. Released on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    registry: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}

#[derive(Debug)]
pub enum Endpoint {
    Stdio,
    /// Unix domain socket path, or named pipe name on Windows.
    Ipc { path: PathBuf },
    Socket { addr: SocketAddr, lease: PortLease },
}

impl Endpoint {
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio => TransportKind::Stdio,
            Self::Ipc { .. } => TransportKind::Ipc,
            Self::Socket { .. } => TransportKind::Socket,
        }
    }

    #[must_use]
    pub fn host(&self) -> Option<IpAddr> {
        match self {
            Self::Socket { addr, .. } => Some(addr.ip()),
            _ => None,
        }
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Socket { lease, .. } => Some(lease.port()),
            _ => None,
        }
    }

    /// Arguments appended after the server entrypoint.
    #[must_use]
    pub fn launch_args(&self) -> Vec<OsString> {
        match self {
            Self::Stdio => vec!["--stdio".into()],
            Self::Ipc { path } => vec!["--pipe".into(), path.clone().into_os_string()],
            Self::Socket { addr, .. } => {
                vec![addr.ip().to_string().into(), addr.port().to_string().into()]
            }
        }
    }

    /// Whether another listener already holds a socket endpoint's port.
    ///
    /// Always false for stdio and ipc endpoints.
    #[must_use]
    pub fn is_occupied(&self) -> bool {
        match self {
            Self::Socket { addr, .. } => TcpListener::bind(addr).is_err(),
            _ => false,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => f.write_str("stdio"),
            Self::Ipc { path } => write!(f, "ipc:{}", path.display()),
            Self::Socket { addr, .. } => write!(f, "{addr}"),
        }
    }
}

/// A connected duplex byte stream to the server.
pub struct Channel {
    kind: TransportKind,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Channel {
    pub fn new(
        kind: TransportKind,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            kind,
            reader,
            writer,
        }
    }

    #[must_use]
    pub fn from_stdio(pipes: StdioPipes) -> Self {
        Self::new(
            TransportKind::Stdio,
            Box::new(pipes.stdout),
            Box::new(pipes.stdin),
        )
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    #[must_use]
    pub fn into_split(
        self,
    ) -> (
        Box<dyn AsyncRead + Send + Unpin>,
        Box<dyn AsyncWrite + Send + Unpin>,
    ) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

pub struct Negotiator {
    settings: TransportSettings,
    registry: PortRegistry,
}

impl Negotiator {
    #[must_use]
    pub fn new(settings: TransportSettings) -> Self {
        Self::with_registry(settings, PortRegistry::new())
    }

    /// Share a lease registry with other negotiators.
    #[must_use]
    pub fn with_registry(settings: TransportSettings, registry: PortRegistry) -> Self {
        Self { settings, registry }
    }

    #[must_use]
    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    #[must_use]
    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    pub fn allocate_endpoint(&self) -> Result<Endpoint, AllocateError> {
        match self.settings.kind() {
            TransportKind::Stdio => Ok(Endpoint::Stdio),
            TransportKind::Ipc => Ok(Endpoint::Ipc {
                path: ipc_path(),
            }),
            TransportKind::Socket => self.allocate_socket(),
        }
    }

    fn allocate_socket(&self) -> Result<Endpoint, AllocateError> {
        let host = self.settings.host();
        if let Some(port) = self.settings.port() {
            let lease = self
                .registry
                .try_lease(port)
                .ok_or(AllocateError::Leased(port))?;
            return Ok(Endpoint::Socket {
                addr: SocketAddr::new(host, port),
                lease,
            });
        }

        for _ in 0..MAX_PORT_PROBES {
            let port = probe_free_port(host)?;
            if let Some(lease) = self.registry.try_lease(port) {
                tracing::debug!(port, "allocated socket endpoint");
                return Ok(Endpoint::Socket {
                    addr: SocketAddr::new(host, port),
                    lease,
                });
            }
            tracing::debug!(port, "probed port is leased, retrying");
        }
        Err(AllocateError::Exhausted(MAX_PORT_PROBES))
    }

    /// Poll until something accepts connections at `endpoint`, or `timeout` elapses.
    ///
    /// Stdio endpoints are ready as soon as the process exists.
    pub async fn await_ready(&self, endpoint: &Endpoint, timeout: Duration) -> bool {
        if matches!(endpoint, Endpoint::Stdio) {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.probe(endpoint, deadline).await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.settings.poll_interval().min(deadline - now)).await;
        }
    }

    /// One connect-then-close attempt.
    async fn probe(&self, endpoint: &Endpoint, deadline: Instant) -> bool {
        let budget = self
            .settings
            .connect_timeout()
            .min(deadline.saturating_duration_since(Instant::now()));
        if budget.is_zero() {
            return false;
        }
        matches!(
            tokio::time::timeout(budget, open(endpoint)).await,
            Ok(Ok(_))
        )
    }

    /// A single connection attempt. Failures are returned, never retried.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<Channel, ConnectError> {
        let timeout = self.settings.connect_timeout();
        let channel = tokio::time::timeout(timeout, open(endpoint))
            .await
            .map_err(|_| ConnectError::TimedOut {
                target: endpoint.to_string(),
                timeout,
            })??;
        tracing::debug!(%endpoint, "connected");
        Ok(channel)
    }
}

async fn open(endpoint: &Endpoint) -> Result<Channel, ConnectError> {
    match endpoint {
        Endpoint::Stdio => Err(ConnectError::StdioNotConnectable),
        Endpoint::Socket { addr, .. } => {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| ConnectError::from_io(addr.to_string(), e))?;
            let _ = stream.set_nodelay(true);
            let (reader, writer) = stream.into_split();
            Ok(Channel::new(
                TransportKind::Socket,
                Box::new(reader),
                Box::new(writer),
            ))
        }
        Endpoint::Ipc { path } => open_ipc(path).await,
    }
}

#[cfg(unix)]
async fn open_ipc(path: &std::path::Path) -> Result<Channel, ConnectError> {
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .map_err(|e| ConnectError::from_io(path.display().to_string(), e))?;
    let (reader, writer) = stream.into_split();
    Ok(Channel::new(
        TransportKind::Ipc,
        Box::new(reader),
        Box::new(writer),
    ))
}

#[cfg(windows)]
async fn open_ipc(path: &std::path::Path) -> Result<Channel, ConnectError> {
    let client = tokio::net::windows::named_pipe::ClientOptions::new()
        .open(path)
        .map_err(|e| ConnectError::from_io(path.display().to_string(), e))?;
    let (reader, writer) = tokio::io::split(client);
    Ok(Channel::new(
        TransportKind::Ipc,
        Box::new(reader),
        Box::new(writer),
    ))
}

fn probe_free_port(host: IpAddr) -> Result<u16, AllocateError> {
    let listener =
        TcpListener::bind((host, 0)).map_err(|source| AllocateError::Probe { host, source })?;
    let port = listener
        .local_addr()
        .map_err(|source| AllocateError::Probe { host, source })?
        .port();
    Ok(port)
}

#[cfg(unix)]
fn ipc_path() -> PathBuf {
    let n = IPC_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("yls-{}-{n}.sock", std::process::id()))
}

#[cfg(windows)]
fn ipc_path() -> PathBuf {
    let n = IPC_COUNTER.fetch_add(1, Ordering::Relaxed);
    PathBuf::from(format!(r"\\.\pipe\yls-{}-{n}", std::process::id()))
}
