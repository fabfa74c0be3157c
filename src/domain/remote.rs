//! Remote host access used by the deployer.
//!
//! The deployer only talks to hosts through [`RemoteConnector`] and
//! [`RemoteSession`]. The production implementation drives the system OpenSSH
//! client; tests substitute a scripted host.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// How to authenticate against the target host.
#[derive(Clone, PartialEq, Eq)]
pub enum HostAuth {
    /// Private key file on the pipeline host.
    Key { path: String },
    /// Password, passed to `sshpass` through the environment.
    Password { password: String },
    /// Whatever the local ssh agent offers.
    Agent,
}

impl fmt::Debug for HostAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key { path } => f.debug_struct("Key").field("path", path).finish(),
            Self::Password { .. } => f.write_str("Password(***)"),
            Self::Agent => f.write_str("Agent"),
        }
    }
}

/// Connection details for one target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub address: String,
    pub port: u16,
    pub user: String,
    pub auth: HostAuth,
    /// Directory under which per-site release trees live.
    pub remote_root: String,
    /// Base port; the blue slot listens here, green on the next port.
    pub app_port: u16,
}

impl HostConfig {
    /// `user@address`, as passed to ssh.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// Result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut out = String::new();
        let stdout = self.stdout.trim_end();
        let stderr = self.stderr.trim_end();
        out.push_str(stdout);
        if !stdout.is_empty() && !stderr.is_empty() {
            out.push('\n');
        }
        out.push_str(stderr);
        out
    }
}

/// Failures talking to a remote host.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("ssh connection failed: {0}")]
    Connect(String),

    #[error("upload failed: {0}")]
    Transfer(String),

    #[error("`{command}` exited with {}", exit_label(.exit_code))]
    Command {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: String,
        after: Duration,
    },

    #[error("deployment cancelled")]
    Cancelled,
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

impl RemoteError {
    /// Captured output of a failed command, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Command { output, .. } => Some(output.as_str()),
            _ => None,
        }
    }

    /// Transfer failures and timeouts may succeed on a second try.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transfer(_) | Self::Timeout { .. })
    }
}

/// Opens sessions to target hosts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Establishes an authenticated connection.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Connect`] or [`RemoteError::Timeout`].
    async fn connect(&self, host: &HostConfig) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// One authenticated connection. Commands run strictly one at a time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Runs a shell command. A non-zero exit is returned as output, not as an error.
    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError>;

    /// Copies a local file to `remote_path`.
    async fn upload(&self, local: &Path, remote_path: &str) -> Result<(), RemoteError>;

    /// Writes `contents` to `remote_path`, replacing it.
    async fn write_file(&self, remote_path: &str, contents: &str) -> Result<(), RemoteError>;

    /// Reads a text file; `None` if it does not exist.
    async fn read_file(&self, remote_path: &str) -> Result<Option<String>, RemoteError>;

    /// Tears down the connection. Errors are logged, not returned.
    async fn close(&self);
}

/// Quotes a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
