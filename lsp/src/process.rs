//! Process supervisor: spawns the server child and owns it until it exits.
//!
//! The `Child` lives inside a waiter task that publishes the exit status on a
//! watch channel. Signals go through that task, which owns the pid until it reaps
//! the child. Dropping the [`ServerProcess`] handle closes the signal channel and
//! the waiter kills the child, so a supervisor that forgets to terminate never leaks it.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::sink::DiagnosticSink;

/// Bounded wait after a force kill.
const KILL_WAIT: Duration = Duration::from_secs(2);

const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("{} not found", program.display())]
    NotFound { program: PathBuf },
    #[error("permission denied executing {}", program.display())]
    PermissionDenied { program: PathBuf },
    #[error("failed to spawn {}: {source}", program.display())]
    Io {
        program: PathBuf,
        source: std::io::Error,
    },
}

impl SpawnError {
    fn from_io(program: &Path, err: std::io::Error) -> Self {
        let program = program.to_path_buf();
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { program },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { program },
            _ => Self::Io {
                program,
                source: err,
            },
        }
    }
}

/// How the server terminated: an exit code, a signal, or (rarely) neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of server output, raw bytes including the line terminator.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    /// Keep stdin/stdout for the message channel instead of draining stdout.
    pub stdio_channel: bool,
}

/// The server's stdin/stdout, handed to the negotiator for the stdio transport.
pub struct StdioPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Requests handled by the waiter task.
#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

pub struct ServerProcess {
    pid: Option<u32>,
    spec: LaunchSpec,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    output_tx: broadcast::Sender<OutputChunk>,
    stdio: Option<StdioPipes>,
    drain_handles: Vec<JoinHandle<()>>,
}

impl ServerProcess {
    /// Launch the server without a shell, in `spec.cwd`.
    pub fn spawn(spec: LaunchSpec, sink: Arc<dyn DiagnosticSink>) -> Result<Self, SpawnError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(if spec.stdio_channel {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SpawnError::from_io(&spec.program, e))?;
        let pid = child.id();
        tracing::info!(
            pid = ?pid,
            program = %spec.program.display(),
            cwd = %spec.cwd.display(),
            "spawned server"
        );

        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let mut drain_handles = Vec::with_capacity(2);

        if let Some(stderr) = child.stderr.take() {
            drain_handles.push(tokio::spawn(drain(
                stderr,
                OutputStream::Stderr,
                sink.clone(),
                output_tx.clone(),
            )));
        }

        let stdio = match (spec.stdio_channel, child.stdin.take(), child.stdout.take()) {
            (true, Some(stdin), Some(stdout)) => Some(StdioPipes { stdin, stdout }),
            (_, _, stdout) => {
                if let Some(stdout) = stdout {
                    drain_handles.push(tokio::spawn(drain(
                        stdout,
                        OutputStream::Stdout,
                        sink.clone(),
                        output_tx.clone(),
                    )));
                }
                None
            }
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    signal = signal_rx.recv() => match signal {
                        Some(Signal::Terminate) => send_sigterm(&child),
                        // None: the handle was dropped.
                        Some(Signal::Kill) | None => {
                            if let Err(e) = child.start_kill() {
                                tracing::debug!("kill failed: {e}");
                            }
                            break child.wait().await;
                        }
                    },
                }
            };
            let exit = match status {
                Ok(status) => ProcessExit::from_status(status),
                Err(e) => {
                    tracing::warn!("waiting on server process failed: {e}");
                    ProcessExit {
                        code: None,
                        signal: None,
                    }
                }
            };
            tracing::info!(pid = ?pid, %exit, "server process exited");
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Self {
            pid,
            spec,
            exit_rx,
            signal_tx,
            output_tx,
            stdio,
            drain_handles,
        })
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.spec.cwd
    }

    #[must_use]
    pub fn args(&self) -> &[OsString] {
        &self.spec.args
    }

    /// Exit status, `None` while running.
    #[must_use]
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Termination event: becomes `Some` once, when the process exits.
    #[must_use]
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// Output lines produced after this call.
    #[must_use]
    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputChunk> {
        self.output_tx.subscribe()
    }

    /// Take the stdin/stdout pipes (stdio transport only, once).
    pub fn take_stdio(&mut self) -> Option<StdioPipes> {
        self.stdio.take()
    }

    /// Wait up to `timeout` for the process to exit.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ProcessExit> {
        let mut rx = self.exit_rx.clone();
        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(exit)) => *exit,
            Ok(Err(_)) | Err(_) => None,
        }
    }

    /// Force-kill without waiting.
    pub fn kill(&mut self) {
        let _ = self.signal_tx.send(Signal::Kill);
    }

    /// Ask the server to stop, escalating to a kill after `grace`.
    ///
    /// Idempotent: once the process has exited this returns the recorded status.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ProcessExit> {
        if let Some(exit) = self.exit_status() {
            return Some(exit);
        }

        if self.request_terminate() {
            if let Some(exit) = self.wait_for_exit(grace).await {
                return Some(exit);
            }
            tracing::debug!(pid = ?self.pid, "server ignored termination request, killing");
        }

        self.kill();
        let exit = self.wait_for_exit(KILL_WAIT).await;
        if exit.is_none() {
            tracing::warn!(pid = ?self.pid, "server did not exit after kill");
        }
        exit
    }

    /// False where there is no graceful signal, so `terminate` goes straight to a kill.
    fn request_terminate(&self) -> bool {
        cfg!(unix) && self.signal_tx.send(Signal::Terminate).is_ok()
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    // `id()` is None once the child has been reaped, so a recycled pid is never signalled.
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: kill(2) with a pid we own and a valid signal number.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        tracing::debug!(pid, "SIGTERM failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.kill();
        for handle in &self.drain_handles {
            handle.abort();
        }
    }
}

impl fmt::Debug for ServerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerProcess")
            .field("pid", &self.pid)
            .field("program", &self.spec.program)
            .field("exit", &self.exit_status())
            .finish_non_exhaustive()
    }
}

/// Forward every line of `reader` to the sink and the output subscribers.
///
/// Output is never interpreted; readiness comes from the transport probe alone.
async fn drain<R: AsyncRead + Unpin>(
    reader: R,
    stream: OutputStream,
    sink: Arc<dyn DiagnosticSink>,
    output_tx: broadcast::Sender<OutputChunk>,
) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    sink.info(text);
                }
                let _ = output_tx.send(OutputChunk {
                    stream,
                    bytes: line.clone(),
                });
            }
            Err(e) => {
                tracing::debug!(?stream, "server output closed: {e}");
                break;
            }
        }
    }
}
