//! yls - command-line front end for the YARA language server supervisor.
//!
//! ```text
//! yls install   provision the server environment
//! yls status    report installation and transport settings
//! yls run       start a session, open rule files, print diagnostics
//! ```
//!
//! Settings come from the config file (`$YLS_CONFIG` or `~/.yls/config.toml`);
//! command-line flags override them.

mod console;

use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use yls_config::YlsConfig;
use yls_lsp::provision::{Environment, Provisioner};
use yls_lsp::sink::DiagnosticSink;
use yls_lsp::{ServerEvent, SessionManager, path_to_file_uri};
use yls_types::{DiagnosticSeverity, DocumentSelector, SupervisorSettings, TransportKind};

use crate::console::ConsoleSink;

#[derive(Parser)]
#[command(name = "yls", version)]
#[command(about = "Provision, launch and supervise the YARA language server")]
struct Cli {
    /// Config file (default: $YLS_CONFIG, then ~/.yls/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Echo informational server output to the terminal
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ServerArgs {
    /// Extension root holding client/install.* and server/
    #[arg(long)]
    root: Option<PathBuf>,
    /// Environment directory (default: <root>/server/env)
    #[arg(long)]
    target: Option<PathBuf>,
}

impl ServerArgs {
    fn apply(self, mut settings: SupervisorSettings) -> SupervisorSettings {
        if let Some(root) = self.root {
            settings.server.root = root;
        }
        if let Some(target) = self.target {
            settings.server.env_dir = Some(target);
        }
        settings
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Install the server environment (no-op when already installed)
    Install {
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Report whether the environment is installed and how sessions connect
    Status {
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Start a session, open rule files, and print their diagnostics
    Run {
        #[command(flatten)]
        server: ServerArgs,
        /// Transport: socket, stdio or ipc
        #[arg(long)]
        transport: Option<TransportKind>,
        /// Fixed loopback port (default: probe a free one)
        #[arg(long)]
        port: Option<u16>,
        /// Stop once every file has reported diagnostics instead of waiting for Ctrl-C
        #[arg(long)]
        once: bool,
        /// Rule files to open (.yar, .yara)
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(config.logging.filter.as_deref());

    let sink: Arc<dyn DiagnosticSink> = Arc::new(ConsoleSink::new("YARA", cli.verbose));
    match cli.command {
        Commands::Install { server } => install(&server.apply(config.settings()), sink).await,
        Commands::Status { server } => status(&server.apply(config.settings()), sink).await,
        Commands::Run {
            server,
            transport,
            port,
            once,
            files,
        } => {
            let mut settings = server.apply(config.settings());
            if let Some(kind) = transport {
                settings.transport = settings.transport.with_kind(kind);
            }
            if port.is_some() {
                settings.transport = settings
                    .transport
                    .with_port(port)
                    .context("invalid --port")?;
            }
            run(settings, sink, &files, once).await
        }
    }
}

fn load_config(explicit: Option<&Path>) -> Result<YlsConfig> {
    match explicit {
        Some(path) => YlsConfig::load_from(path).context("loading config"),
        None => Ok(YlsConfig::load()
            .context("loading config")?
            .unwrap_or_default()),
    }
}

async fn install(settings: &SupervisorSettings, sink: Arc<dyn DiagnosticSink>) -> Result<ExitCode> {
    let target = settings.server.env_dir();
    if provision(settings, sink).await {
        println!("installed: {}", target.display());
        Ok(ExitCode::SUCCESS)
    } else {
        println!("not installed: {}", target.display());
        Ok(ExitCode::FAILURE)
    }
}

/// Run the installer if needed, then confirm with the package listing.
async fn provision(settings: &SupervisorSettings, sink: Arc<dyn DiagnosticSink>) -> bool {
    let target = settings.server.env_dir();
    let provisioner = Provisioner::new(settings.provision.clone(), sink);
    provisioner
        .ensure_installed(&settings.server.root, &target)
        .await
        && provisioner.is_installed(&target).await
}

async fn status(settings: &SupervisorSettings, sink: Arc<dyn DiagnosticSink>) -> Result<ExitCode> {
    let target = settings.server.env_dir();
    let provisioner = Provisioner::new(settings.provision.clone(), sink);
    let installed = provisioner.is_installed(&target).await;
    let runtime = settings
        .server
        .runtime_override()
        .unwrap_or_else(|| Environment::new(&target).runtime_executable());
    let transport = &settings.transport;

    println!("environment: {}", target.display());
    println!("installed:   {}", if installed { "yes" } else { "no" });
    println!("runtime:     {}", runtime.display());
    println!("entrypoint:  {}", settings.server.entrypoint().display());
    println!("transport:   {}", transport.kind());
    if transport.kind() == TransportKind::Socket {
        let port = transport
            .port()
            .map_or_else(|| String::from("probed per session"), |p| p.to_string());
        println!("host:        {}", transport.host());
        println!("port:        {port}");
    }
    if let Some(path) = YlsConfig::path() {
        println!("config:      {}", path.display());
    }

    Ok(if installed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run(
    settings: SupervisorSettings,
    sink: Arc<dyn DiagnosticSink>,
    files: &[PathBuf],
    once: bool,
) -> Result<ExitCode> {
    let mut manager = SessionManager::new(settings, sink);
    if let Err(e) = manager.start().await {
        manager.shutdown().await;
        return Err(e).context("starting the language server");
    }
    let session = manager.current().context("session disappeared after start")?;
    let client = session.client().context("session has no channel")?;
    let mut events = session.take_events().context("session events already taken")?;
    if let Some(handle) = session.handle() {
        tracing::info!(pid = ?handle.pid, port = ?handle.port, transport = %handle.transport, "session active");
    }

    let root_uri = std::env::current_dir()
        .ok()
        .and_then(|dir| path_to_file_uri(&dir).ok());
    client
        .initialize(root_uri.as_ref().map(|u| u.as_str()))
        .await
        .context("initialize")?;
    client
        .did_change_configuration(serde_json::json!({ "compile_on_save": true }))
        .await
        .context("didChangeConfiguration")?;

    let mut pending = Vec::new();
    for file in files {
        let path = fs::canonicalize(file).with_context(|| format!("{}", file.display()))?;
        let uri = path_to_file_uri(&path)?;
        let language = path
            .extension()
            .and_then(OsStr::to_str)
            .and_then(DocumentSelector::language_for_extension)
            .unwrap_or("plaintext");
        if !manager.handles(uri.as_str(), language) {
            tracing::warn!(path = %path.display(), "not a rule file, skipping");
            continue;
        }
        let text =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        client.did_open(uri.as_str(), &text).await?;
        client.did_save(uri.as_str()).await?;
        pending.push(uri.to_string());
    }

    let mut errors = 0usize;
    let mut lost = false;
    loop {
        if once && pending.is_empty() {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(ServerEvent::Diagnostics { uri, items }) => {
                    pending.retain(|p| *p != uri);
                    let shown = yls_lsp::file_uri_to_path(&uri)
                        .map_or_else(|| uri.clone(), |p| p.display().to_string());
                    for diagnostic in &items {
                        if diagnostic.severity() == DiagnosticSeverity::Error {
                            errors += 1;
                        }
                        println!("{shown}:{diagnostic}");
                    }
                }
                Some(ServerEvent::Closed(closed)) => {
                    tracing::warn!("channel {closed}");
                    lost = true;
                    break;
                }
                None => break,
            },
        }
    }

    manager.shutdown().await;
    Ok(if errors == 0 && !lost {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_tracing(config_filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_filter.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates(YlsConfig::path().as_deref()) {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates(config_path: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: next to the config file ($YLS_CONFIG or ~/.yls/config.toml)
    if let Some(config_dir) = config_path.and_then(Path::parent) {
        candidates.push(config_dir.join("logs").join("yls.log"));
    }

    // Fallback: ./.yls/logs/yls.log
    candidates.push(PathBuf::from(".yls").join("logs").join("yls.log"));

    candidates
}
