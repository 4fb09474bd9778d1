//! Resolved supervisor settings.
//!
//! Every table has a full set of defaults, so an empty config file (or none at all)
//! yields a working socket-transport setup rooted at the current directory.
//! Transport values are validated at the deserialization boundary; a
//! `TransportSettings` that exists is one the negotiator can use.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{DocumentSelector, SERVER_PACKAGE, TransportKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("transport host {0} is not a loopback address")]
    NonLoopbackHost(IpAddr),
    #[error("transport port must not be 0 (omit it to probe for a free port)")]
    ZeroPort,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// All supervisor settings, one field per config table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub server: ServerSettings,
    pub transport: TransportSettings,
    pub provision: ProvisionSettings,
    pub lifecycle: LifecycleSettings,
    pub documents: DocumentSelector,
}

/// Where the server lives. Relative paths are resolved against `root`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Extension root: holds `client/install.{sh,ps1}` and the `server/` tree.
    pub root: PathBuf,
    /// Provisioned environment directory. Default: `<root>/server/env`.
    pub env_dir: Option<PathBuf>,
    /// Server entrypoint script handed to the runtime.
    pub entrypoint: PathBuf,
    /// Working directory of the server process.
    pub working_dir: PathBuf,
    /// Runtime executable override. Default: the environment's interpreter.
    pub runtime: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            env_dir: None,
            entrypoint: PathBuf::from("server").join("vscode_yara.py"),
            working_dir: PathBuf::from("server"),
            runtime: None,
        }
    }
}

impl ServerSettings {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    #[must_use]
    pub fn env_dir(&self) -> PathBuf {
        match &self.env_dir {
            Some(dir) => self.resolve(dir),
            None => self.root.join("server").join("env"),
        }
    }

    #[must_use]
    pub fn entrypoint(&self) -> PathBuf {
        self.resolve(&self.entrypoint)
    }

    #[must_use]
    pub fn working_dir(&self) -> PathBuf {
        self.resolve(&self.working_dir)
    }

    #[must_use]
    pub fn runtime_override(&self) -> Option<PathBuf> {
        self.runtime.as_deref().map(|p| self.resolve(p))
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct RawTransportSettings {
    kind: TransportKind,
    host: IpAddr,
    port: Option<u16>,
    bind_timeout_ms: u64,
    poll_interval_ms: u64,
    connect_timeout_ms: u64,
}

impl Default for RawTransportSettings {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: None,
            bind_timeout_ms: 5_000,
            poll_interval_ms: 100,
            connect_timeout_ms: 2_000,
        }
    }
}

/// Validated transport settings.
///
/// Invariant: `host` is loopback, `port` is never `Some(0)`, all durations are non-zero.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawTransportSettings")]
pub struct TransportSettings {
    kind: TransportKind,
    host: IpAddr,
    port: Option<u16>,
    bind_timeout: Duration,
    poll_interval: Duration,
    connect_timeout: Duration,
}

impl TryFrom<RawTransportSettings> for TransportSettings {
    type Error = SettingsError;

    fn try_from(raw: RawTransportSettings) -> Result<Self, Self::Error> {
        if !raw.host.is_loopback() {
            return Err(SettingsError::NonLoopbackHost(raw.host));
        }
        if raw.port == Some(0) {
            return Err(SettingsError::ZeroPort);
        }
        for (name, value) in [
            ("bind_timeout_ms", raw.bind_timeout_ms),
            ("poll_interval_ms", raw.poll_interval_ms),
            ("connect_timeout_ms", raw.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(SettingsError::ZeroDuration(name));
            }
        }
        Ok(Self {
            kind: raw.kind,
            host: raw.host,
            port: raw.port,
            bind_timeout: Duration::from_millis(raw.bind_timeout_ms),
            poll_interval: Duration::from_millis(raw.poll_interval_ms),
            connect_timeout: Duration::from_millis(raw.connect_timeout_ms),
        })
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::try_from(RawTransportSettings::default()).unwrap_or_else(|_| unreachable!())
    }
}

impl TransportSettings {
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    #[must_use]
    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// Fixed port, or `None` to probe the OS for a free one per session.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Upper bound on the wait for the server to start listening.
    #[must_use]
    pub fn bind_timeout(&self) -> Duration {
        self.bind_timeout
    }

    /// Pause between readiness probes, and the window used to attribute a lost
    /// channel to a process exit.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Result<Self, SettingsError> {
        if port == Some(0) {
            return Err(SettingsError::ZeroPort);
        }
        self.port = port;
        Ok(self)
    }

    pub fn with_bind_timeout(mut self, timeout: Duration) -> Result<Self, SettingsError> {
        if timeout.is_zero() {
            return Err(SettingsError::ZeroDuration("bind_timeout_ms"));
        }
        self.bind_timeout = timeout;
        Ok(self)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Result<Self, SettingsError> {
        if interval.is_zero() {
            return Err(SettingsError::ZeroDuration("poll_interval_ms"));
        }
        self.poll_interval = interval;
        Ok(self)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisionSettings {
    /// Run the installer when the environment is missing. When false, a missing
    /// environment fails the session with `provisioning-failed`.
    pub auto_install: bool,
    /// Installer script override. Default: `<root>/client/install.sh` (`install.ps1` on Windows).
    pub script: Option<PathBuf>,
    /// Package name that must appear in the runtime's package listing.
    pub required_package: String,
    /// Arguments that make the runtime print its installed packages.
    pub list_args: Vec<String>,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            auto_install: true,
            script: None,
            required_package: String::from(SERVER_PACKAGE),
            list_args: vec!["-m".into(), "pip".into(), "list".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Time the server gets to exit after a termination request before it is killed.
    pub terminate_grace_ms: u64,
    /// Upper bound on a single JSON-RPC request round trip.
    pub request_timeout_ms: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            terminate_grace_ms: 2_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl LifecycleSettings {
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}
