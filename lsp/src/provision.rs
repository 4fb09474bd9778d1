//! Environment provisioner.
//!
//! An environment is a directory holding an isolated runtime. It counts as
//! installed only when that runtime lists the server package; a directory that
//! merely exists proves nothing. Installation runs the extension's installer
//! script with the target directory as its single argument.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use yls_types::ProvisionSettings;

use crate::sink::DiagnosticSink;

/// A provisioned (or to-be-provisioned) runtime directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    dir: PathBuf,
}

impl Environment {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Interpreter inside the environment.
    #[must_use]
    pub fn runtime_executable(&self) -> PathBuf {
        #[cfg(windows)]
        {
            self.dir.join("Scripts").join("python.exe")
        }
        #[cfg(not(windows))]
        {
            self.dir.join("bin").join("python")
        }
    }
}

pub struct Provisioner {
    settings: ProvisionSettings,
    sink: Arc<dyn DiagnosticSink>,
}

impl Provisioner {
    pub fn new(settings: ProvisionSettings, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self { settings, sink }
    }

    #[must_use]
    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    /// Installer script for an extension root.
    #[must_use]
    pub fn script_path(&self, root: &Path) -> PathBuf {
        if let Some(script) = &self.settings.script {
            return if script.is_absolute() {
                script.clone()
            } else {
                root.join(script)
            };
        }
        let name = if cfg!(windows) {
            "install.ps1"
        } else {
            "install.sh"
        };
        root.join("client").join(name)
    }

    /// Whether the environment at `target` lists the required package.
    ///
    /// Never fails: a missing runtime or a failing listing is simply `false`.
    pub async fn is_installed(&self, target: &Path) -> bool {
        let runtime = Environment::new(target).runtime_executable();
        if !runtime.is_file() {
            tracing::debug!(runtime = %runtime.display(), "no runtime in environment");
            return false;
        }

        let output = Command::new(&runtime)
            .args(&self.settings.list_args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let listing = String::from_utf8_lossy(&output.stdout);
                let found = listing.contains(&self.settings.required_package);
                tracing::debug!(
                    target = %target.display(),
                    package = %self.settings.required_package,
                    found,
                    "checked package listing"
                );
                found
            }
            Ok(output) => {
                tracing::debug!(
                    runtime = %runtime.display(),
                    status = %output.status,
                    "package listing failed"
                );
                false
            }
            Err(e) => {
                tracing::debug!(runtime = %runtime.display(), "package listing failed: {e}");
                false
            }
        }
    }

    /// Make sure `target` holds an installed environment, running the installer if needed.
    ///
    /// Returns true without side effects when already installed. Otherwise returns
    /// whether the installer exited with status zero; a partial install is left as is.
    pub async fn ensure_installed(&self, root: &Path, target: &Path) -> bool {
        if self.is_installed(target).await {
            tracing::debug!(target = %target.display(), "environment already installed");
            return true;
        }

        let script = self.script_path(root);
        if !script.is_file() {
            self.sink.error(&format!(
                "Installer script {} does not exist",
                script.display()
            ));
            return false;
        }

        let mut cmd = match installer_command(&script) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.sink
                    .error(&format!("No shell available to run the installer: {e}"));
                return false;
            }
        };
        cmd.arg(target)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        self.sink.info(&format!(
            "Installing the YARA language server into {}",
            target.display()
        ));
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.sink.error(&format!(
                    "Failed to run installer {}: {e}",
                    script.display()
                ));
                return false;
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, (), ()) = tokio::join!(
            child.wait(),
            forward_lines(stdout, self.sink.as_ref()),
            forward_lines(stderr, self.sink.as_ref()),
        );

        match status {
            Ok(status) if status.success() => {
                self.sink.info("Installer finished");
                true
            }
            Ok(status) => {
                self.sink.error(&format!("Installer exited with {status}"));
                false
            }
            Err(e) => {
                self.sink.error(&format!("Waiting on installer failed: {e}"));
                false
            }
        }
    }
}

#[cfg(windows)]
fn installer_command(script: &Path) -> Result<Command, which::Error> {
    let shell = which::which("pwsh").or_else(|_| which::which("powershell"))?;
    let mut cmd = Command::new(shell);
    cmd.args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-File"])
        .arg(script);
    Ok(cmd)
}

#[cfg(not(windows))]
fn installer_command(script: &Path) -> Result<Command, which::Error> {
    let shell = which::which("sh")?;
    let mut cmd = Command::new(shell);
    cmd.arg(script);
    Ok(cmd)
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: Option<R>, sink: &dyn DiagnosticSink) {
    let Some(reader) = reader else { return };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => sink.info(line.trim_end()),
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("installer output closed: {e}");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::sink::{RecordingSink, SinkLevel};

    /// An extension root whose installer writes a fake runtime that lists `listing`.
    fn fake_root(listing: &str, installer_exit: i32) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let client = root.path().join("client");
        std::fs::create_dir_all(&client).unwrap();
        let script = format!(
            "#!/bin/sh\n\
             set -e\n\
             echo \"installing into $1\"\n\
             mkdir -p \"$1/bin\"\n\
             printf '#!/bin/sh\\necho \"Package Version\"\\necho \"{listing} 0.1\"\\n' > \"$1/bin/python\"\n\
             chmod +x \"$1/bin/python\"\n\
             exit {installer_exit}\n"
        );
        std::fs::write(client.join("install.sh"), script).unwrap();
        root
    }

    fn provisioner(sink: Arc<RecordingSink>) -> Provisioner {
        Provisioner::new(ProvisionSettings::default(), sink)
    }

    #[test]
    fn runtime_path_inside_environment() {
        let env = Environment::new("/opt/ext/server/env");
        assert_eq!(
            env.runtime_executable(),
            PathBuf::from("/opt/ext/server/env/bin/python")
        );
    }

    #[test]
    fn script_override_is_relative_to_root() {
        let sink = Arc::new(RecordingSink::new("test"));
        let settings = ProvisionSettings {
            script: Some(PathBuf::from("tools/setup.sh")),
            ..ProvisionSettings::default()
        };
        let provisioner = Provisioner::new(settings, sink);
        assert_eq!(
            provisioner.script_path(Path::new("/opt/ext")),
            PathBuf::from("/opt/ext/tools/setup.sh")
        );
    }

    #[tokio::test]
    async fn fresh_target_installs_then_reports_installed() {
        let root = fake_root("yarals", 0);
        let target = root.path().join("server").join("env");
        let sink = Arc::new(RecordingSink::new("test"));
        let provisioner = provisioner(sink.clone());

        assert!(!provisioner.is_installed(&target).await);
        assert!(provisioner.ensure_installed(root.path(), &target).await);
        assert!(provisioner.is_installed(&target).await);
        assert!(sink.contains(SinkLevel::Info, "installing into"));
    }

    #[tokio::test]
    async fn already_installed_is_idempotent() {
        let root = fake_root("yarals", 0);
        let target = root.path().join("env");
        let sink = Arc::new(RecordingSink::new("test"));
        let provisioner = provisioner(sink.clone());
        assert!(provisioner.ensure_installed(root.path(), &target).await);

        let runtime = Environment::new(&target).runtime_executable();
        let before = std::fs::metadata(&runtime).unwrap().modified().unwrap();
        // Make a second installer run detectable.
        std::fs::remove_file(root.path().join("client").join("install.sh")).unwrap();

        assert!(provisioner.ensure_installed(root.path(), &target).await);
        let after = std::fs::metadata(&runtime).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn directory_without_package_is_not_installed() {
        let root = fake_root("pip", 0);
        let target = root.path().join("env");
        let sink = Arc::new(RecordingSink::new("test"));
        let provisioner = provisioner(sink.clone());

        // The installer succeeds but the listing lacks the server package.
        assert!(provisioner.ensure_installed(root.path(), &target).await);
        assert!(target.is_dir());
        assert!(!provisioner.is_installed(&target).await);
    }

    #[tokio::test]
    async fn failing_installer_returns_false() {
        let root = fake_root("yarals", 2);
        let target = root.path().join("env");
        let sink = Arc::new(RecordingSink::new("test"));
        let provisioner = provisioner(sink.clone());

        assert!(!provisioner.ensure_installed(root.path(), &target).await);
        assert!(sink.contains(SinkLevel::Error, "Installer exited"));
    }

    #[tokio::test]
    async fn missing_script_returns_false() {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::new("test"));
        let provisioner = provisioner(sink.clone());
        assert!(
            !provisioner
                .ensure_installed(root.path(), &root.path().join("env"))
                .await
        );
        assert!(sink.contains(SinkLevel::Error, "does not exist"));
    }

    #[tokio::test]
    async fn broken_runtime_is_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let python = bin.join("python");
        std::fs::write(&python, "#!/bin/sh\necho yarals\nexit 1\n").unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();

        let provisioner = provisioner(Arc::new(RecordingSink::new("test")));
        assert!(!provisioner.is_installed(dir.path()).await);
    }
}
