//! Remote host access through the system OpenSSH client.
//!
//! [`OpenSshConnector::connect`] starts one background master connection per
//! session. Every command, upload and file write then multiplexes over its
//! control socket, so authentication happens exactly once per deploy.
//!
//! Password authentication goes through `sshpass -e`; the password is passed
//! in the child's environment and never appears on a command line.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::domain::remote::{
    CommandOutput, HostAuth, HostConfig, RemoteConnector, RemoteError, RemoteSession, shell_quote,
};

/// Grace added to the ssh `ConnectTimeout` for the whole master handshake.
const HANDSHAKE_GRACE: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const SSH_FAILURE_EXIT: i32 = 255;
/// Exit status of the file read when the file is absent.
const MISSING_FILE_EXIT: i32 = 3;

/// Opens [`OpenSshSession`]s.
pub struct OpenSshConnector {
    connect_timeout: Duration,
    control_dir: PathBuf,
}

impl OpenSshConnector {
    /// `control_dir` holds the master control sockets; it must be private to
    /// the pipeline user.
    pub fn new(connect_timeout: Duration, control_dir: impl Into<PathBuf>) -> Self {
        Self {
            connect_timeout,
            control_dir: control_dir.into(),
        }
    }
}

/// A live master connection to one host.
pub struct OpenSshSession {
    target: SshTarget,
}

/// Everything needed to address the master connection of one session.
#[derive(Debug, Clone)]
struct SshTarget {
    destination: String,
    port: u16,
    control_path: PathBuf,
}

impl SshTarget {
    /// Diagnostics of the backgrounded master, which has no usable stderr.
    fn log_path(&self) -> PathBuf {
        self.control_path.with_extension("log")
    }

    fn control_option(&self) -> String {
        format!("ControlPath={}", self.control_path.display())
    }

    /// `ssh` invocation running `command` over the master connection.
    fn exec_args(&self, command: &str) -> Vec<String> {
        vec![
            "-o".to_string(),
            self.control_option(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            self.destination.clone(),
            "--".to_string(),
            command.to_string(),
        ]
    }

    fn upload_args(&self, local: &Path, remote_path: &str) -> Vec<String> {
        vec![
            "-q".to_string(),
            "-o".to_string(),
            self.control_option(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-P".to_string(),
            self.port.to_string(),
            local.display().to_string(),
            format!("{}:{}", self.destination, shell_quote(remote_path)),
        ]
    }

    fn check_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            self.control_option(),
            "-p".to_string(),
            self.port.to_string(),
            "-O".to_string(),
            "check".to_string(),
            self.destination.clone(),
        ]
    }

    fn exit_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            self.control_option(),
            "-p".to_string(),
            self.port.to_string(),
            "-O".to_string(),
            "exit".to_string(),
            self.destination.clone(),
        ]
    }
}

/// Program and arguments starting a background master connection.
fn master_command(host: &HostConfig, target: &SshTarget, connect_timeout: Duration) -> (String, Vec<String>) {
    let mut args = vec![
        "-M".to_string(),
        "-N".to_string(),
        "-f".to_string(),
        "-o".to_string(),
        target.control_option(),
        "-o".to_string(),
        "ControlPersist=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "-o".to_string(),
        "ServerAliveInterval=15".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-E".to_string(),
        target.log_path().display().to_string(),
    ];

    let program = match &host.auth {
        HostAuth::Key { path } => {
            args.extend([
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
                "-i".to_string(),
                path.clone(),
            ]);
            "ssh".to_string()
        }
        HostAuth::Agent => {
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
            "ssh".to_string()
        }
        HostAuth::Password { .. } => {
            args.extend([
                "-o".to_string(),
                "PubkeyAuthentication=no".to_string(),
                "-o".to_string(),
                "PreferredAuthentications=password,keyboard-interactive".to_string(),
            ]);
            args.insert(0, "ssh".to_string());
            args.insert(0, "-e".to_string());
            "sshpass".to_string()
        }
    };

    args.extend([
        "-p".to_string(),
        target.port.to_string(),
        target.destination.clone(),
    ]);
    (program, args)
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn command_output(output: Output) -> CommandOutput {
    CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

#[async_trait]
impl RemoteConnector for OpenSshConnector {
    async fn connect(&self, host: &HostConfig) -> Result<Box<dyn RemoteSession>, RemoteError> {
        tokio::fs::create_dir_all(&self.control_dir)
            .await
            .map_err(|e| RemoteError::Connect(format!("control directory: {e}")))?;

        let target = SshTarget {
            destination: host.destination(),
            port: host.port,
            control_path: self
                .control_dir
                .join(format!("{}.sock", Uuid::new_v4().simple())),
        };
        let (program, args) = master_command(host, &target, self.connect_timeout);

        // The master forks into the background and would hold piped stdio
        // open, so only the exit status is awaited.
        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let HostAuth::Password { password } = &host.auth {
            command.env("SSHPASS", password);
        }

        let limit = self.connect_timeout + HANDSHAKE_GRACE;
        let status = tokio::time::timeout(limit, command.status())
            .await
            .map_err(|_| RemoteError::Timeout {
                operation: format!("ssh connect to {}", target.destination),
                after: limit,
            })?
            .map_err(|e| RemoteError::Connect(format!("failed to spawn {program}: {e}")))?;

        if !status.success() {
            let log = tokio::fs::read_to_string(target.log_path())
                .await
                .unwrap_or_default();
            let _ = tokio::fs::remove_file(target.log_path()).await;
            let reason = match log.trim() {
                "" => format!("{program} exited with {status}"),
                text => text.to_string(),
            };
            return Err(RemoteError::Connect(reason));
        }

        tracing::debug!(destination = %target.destination, port = target.port, "SSH master connected");
        Ok(Box::new(OpenSshSession { target }))
    }
}

impl OpenSshSession {
    /// Asks the master whether it is still running.
    async fn master_alive(&self) -> bool {
        let check = Command::new("ssh")
            .args(self.target.check_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(CHECK_TIMEOUT, check).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Failed to spawn ssh for master check");
                false
            }
            Err(_) => false,
        }
    }
}

/// Maps a finished `ssh` exec: exit 255 is a lost connection only when the
/// master is gone, otherwise it is the remote command's own status.
fn exec_result(output: Output, master_alive: bool) -> Result<CommandOutput, RemoteError> {
    if output.status.code() == Some(SSH_FAILURE_EXIT) && !master_alive {
        return Err(RemoteError::Connect(stderr_text(&output)));
    }
    Ok(command_output(output))
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        tracing::debug!(destination = %self.target.destination, command, "Remote exec");
        let output = Command::new("ssh")
            .args(self.target.exec_args(command))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RemoteError::Connect(format!("failed to spawn ssh: {e}")))?;

        // ssh exits 255 on its own failures, but so may the remote command.
        let master_alive = output.status.code() != Some(SSH_FAILURE_EXIT) || self.master_alive().await;
        exec_result(output, master_alive)
    }

    async fn upload(&self, local: &Path, remote_path: &str) -> Result<(), RemoteError> {
        let output = Command::new("scp")
            .args(self.target.upload_args(local, remote_path))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RemoteError::Transfer(format!("failed to spawn scp: {e}")))?;

        if !output.status.success() {
            return Err(RemoteError::Transfer(stderr_text(&output)));
        }
        Ok(())
    }

    async fn write_file(&self, remote_path: &str, contents: &str) -> Result<(), RemoteError> {
        let command = format!("cat > {}", shell_quote(remote_path));
        let mut child = Command::new("ssh")
            .args(self.target.exec_args(&command))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::Connect(format!("failed to spawn ssh: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(contents.as_bytes())
                .await
                .map_err(|e| RemoteError::Transfer(format!("writing {remote_path}: {e}")))?;
            // Dropping stdin sends EOF so `cat` exits.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RemoteError::Transfer(format!("writing {remote_path}: {e}")))?;
        if !output.status.success() {
            let output = command_output(output);
            return Err(RemoteError::Command {
                command,
                exit_code: output.exit_code,
                output: output.combined(),
            });
        }
        Ok(())
    }

    async fn read_file(&self, remote_path: &str) -> Result<Option<String>, RemoteError> {
        let quoted = shell_quote(remote_path);
        let command = format!("[ -f {quoted} ] || exit {MISSING_FILE_EXIT}; cat {quoted}");
        let output = self.exec(&command).await?;
        match output.exit_code {
            Some(0) => Ok(Some(output.stdout)),
            Some(MISSING_FILE_EXIT) => Ok(None),
            exit_code => Err(RemoteError::Command {
                command,
                exit_code,
                output: output.combined(),
            }),
        }
    }

    async fn close(&self) {
        let result = tokio::time::timeout(
            CLOSE_TIMEOUT,
            Command::new("ssh")
                .args(self.target.exit_args())
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {}
            Ok(Ok(output)) => {
                tracing::warn!(destination = %self.target.destination, stderr = %stderr_text(&output), "SSH master exit failed");
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to spawn ssh for master exit"),
            Err(_) => tracing::warn!(destination = %self.target.destination, "SSH master exit timed out"),
        }

        for path in [self.target.control_path.clone(), self.target.log_path()] {
            if let Err(e) = tokio::fs::remove_file(&path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove ssh session file");
            }
        }
    }
}
