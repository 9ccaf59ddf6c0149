//! OpenSSH-backed remote sessions.
//!
//! `open` starts a control master (`ssh -M -N`) that holds the
//! authenticated connection; each command then runs over the control socket
//! without re-authenticating. `close` stops the master and removes the
//! socket, and dropping an unclosed session kills the master.

use crate::models::config::RemoteConfig;
use crate::models::device::Device;
use crate::services::luna::LunaCommand;
use crate::services::remote::{
    CommandOutcome, Credentials, RemoteConnector, RemoteSession, ResponsePatterns,
};
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Exit status ssh uses for its own (not the remote command's) failures.
const SSH_ERROR_EXIT: i32 = 255;

/// Opens SSH sessions to the device's developer-mode endpoint.
pub struct SshConnector {
    config: RemoteConfig,
}

impl SshConnector {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    /// Check if the ssh client is installed.
    pub fn is_installed(program: &str) -> bool {
        std::process::Command::new(program)
            .arg("-V")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Check if sshpass is installed.
    pub fn is_sshpass_installed() -> bool {
        std::process::Command::new("sshpass")
            .arg("-V")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn common_args(&self, control_path: &Path) -> Vec<String> {
        vec![
            "-p".to_string(),
            self.config.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=5".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
        ]
    }

    fn auth_args(credentials: &Credentials) -> Vec<String> {
        match credentials {
            Credentials::Key { identity_file, .. } => {
                let mut args = vec![
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    "-o".to_string(),
                    "PasswordAuthentication=no".to_string(),
                ];
                if let Some(file) = identity_file {
                    args.push("-i".to_string());
                    args.push(file.display().to_string());
                    args.push("-o".to_string());
                    args.push("IdentitiesOnly=yes".to_string());
                }
                args
            }
            Credentials::Password { .. } => vec![
                "-o".to_string(),
                "PubkeyAuthentication=no".to_string(),
                "-o".to_string(),
                "PreferredAuthentications=password,keyboard-interactive".to_string(),
                "-o".to_string(),
                "NumberOfPasswordPrompts=1".to_string(),
            ],
        }
    }

    fn master_command(&self, credentials: &Credentials) -> Command {
        match credentials {
            Credentials::Password { password, .. } => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(&self.config.ssh_program).env("SSHPASS", password);
                cmd
            }
            Credentials::Key { .. } => Command::new(&self.config.ssh_program),
        }
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn open(
        &self,
        device: &Device,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteSession>> {
        let target = format!("{}@{}", credentials.user(), device.address);
        let control_path = std::env::temp_dir().join(format!(
            "lgtv-{}.ctl",
            &Uuid::new_v4().simple().to_string()[..12]
        ));

        tracing::debug!("Opening SSH control master to {}:{}", target, self.config.port);

        let mut master = self
            .master_command(credentials)
            .args(self.common_args(&control_path))
            .args(Self::auth_args(credentials))
            .args(["-M", "-N"])
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound if credentials.uses_password() => {
                    crate::Error::SshpassNotFound
                }
                std::io::ErrorKind::NotFound => crate::Error::SshClientNotFound,
                _ => crate::Error::Io(e),
            })?;

        let deadline = Instant::now() + self.config.connect_timeout() + Duration::from_secs(2);
        loop {
            if master.try_wait()?.is_some() {
                let mut stderr = String::new();
                if let Some(mut err) = master.stderr.take() {
                    let _ = err.read_to_string(&mut stderr).await;
                }
                let _ = std::fs::remove_file(&control_path);
                return Err(classify_ssh_failure(&device.address.to_string(), &stderr));
            }

            if master_alive(&self.config.ssh_program, &control_path, &target).await {
                break;
            }

            if Instant::now() >= deadline {
                let _ = master.kill().await;
                let _ = std::fs::remove_file(&control_path);
                return Err(crate::Error::Unreachable(format!(
                    "{}: SSH connection not established within {}s",
                    device.address, self.config.connect_timeout_secs
                )));
            }

            tokio::time::sleep(MASTER_POLL_INTERVAL).await;
        }

        tracing::info!("SSH session open: {}", target);

        Ok(Box::new(SshSession {
            ssh_program: self.config.ssh_program.clone(),
            port: self.config.port,
            target,
            control_path,
            master,
            closed: false,
        }))
    }
}

/// Whether the control master at `control_path` is accepting requests.
async fn master_alive(ssh_program: &str, control_path: &Path, target: &str) -> bool {
    Command::new(ssh_program)
        .arg("-o")
        .arg(format!("ControlPath={}", control_path.display()))
        .args(["-O", "check"])
        .arg(target)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Map ssh's stderr onto an error kind.
pub fn classify_ssh_failure(host: &str, stderr: &str) -> crate::Error {
    let lower = stderr.to_lowercase();
    let detail = if stderr.trim().is_empty() {
        format!("{}: ssh exited unexpectedly", host)
    } else {
        format!("{}: {}", host, stderr.trim())
    };

    const AUTH_MARKERS: &[&str] = &[
        "permission denied",
        "authentication failed",
        "too many authentication failures",
        "no supported authentication methods",
    ];
    const UNREACHABLE_MARKERS: &[&str] = &[
        "connection refused",
        "timed out",
        "no route to host",
        "network is unreachable",
        "host is down",
        "could not resolve",
        "connection closed",
        "connection reset",
    ];

    if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        crate::Error::Authentication(detail)
    } else if UNREACHABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        crate::Error::Unreachable(detail)
    } else {
        crate::Error::Protocol(detail)
    }
}

/// An SSH control-master session.
pub struct SshSession {
    ssh_program: String,
    port: u16,
    target: String,
    control_path: PathBuf,
    master: Child,
    closed: bool,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(
        &mut self,
        command: &LunaCommand,
        patterns: &ResponsePatterns,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome> {
        if self.closed {
            return Err(crate::Error::Protocol(format!("{}: session closed", self.target)));
        }

        tracing::debug!("[{}] {:?}: {}", self.target, command.kind, command.uri);

        let mut cmd = Command::new(&self.ssh_program);
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .args(["-o", "ControlMaster=no", "-o", "BatchMode=yes", "-p"])
            .arg(self.port.to_string())
            .arg(&self.target)
            .arg(command.render())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(crate::Error::Cancelled),
            result = tokio::time::timeout(timeout, cmd.output()) => match result {
                Err(_) => {
                    tracing::warn!("[{}] command timed out after {:?}", self.target, timeout);
                    return Ok(CommandOutcome::Timeout);
                }
                Ok(output) => output?,
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.code() == Some(SSH_ERROR_EXIT) {
            return Err(classify_ssh_failure(&self.target, &stderr));
        }

        let body = if stdout.trim().is_empty() {
            stderr.as_ref()
        } else {
            stdout.as_ref()
        };
        let outcome = patterns.classify(body);
        tracing::debug!("[{}] outcome: {:?}", self.target, outcome);
        Ok(outcome)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let _ = Command::new(&self.ssh_program)
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .args(["-O", "exit"])
            .arg(&self.target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        let _ = self.master.kill().await;
        let _ = std::fs::remove_file(&self.control_path);

        tracing::info!("SSH session closed: {}", self.target);
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.master.start_kill();
            let _ = std::fs::remove_file(&self.control_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ssh_failure() {
        assert!(matches!(
            classify_ssh_failure("tv", "prisoner@tv: Permission denied (publickey)."),
            crate::Error::Authentication(_)
        ));
        assert!(matches!(
            classify_ssh_failure("tv", "ssh: connect to host tv port 9922: Connection refused"),
            crate::Error::Unreachable(_)
        ));
        assert!(matches!(
            classify_ssh_failure("tv", "kex_exchange_identification: banner exchange failed"),
            crate::Error::Protocol(_)
        ));
        assert!(matches!(classify_ssh_failure("tv", ""), crate::Error::Protocol(_)));
    }

    #[test]
    fn test_key_auth_args_use_identity_file() {
        let args = SshConnector::auth_args(&Credentials::Key {
            user: "prisoner".to_string(),
            identity_file: Some(PathBuf::from("/home/u/.ssh/tv_webos")),
        });
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"/home/u/.ssh/tv_webos".to_string()));
    }

    #[test]
    fn test_common_args_carry_port_and_control_path() {
        let connector = SshConnector::new(RemoteConfig::default());
        let args = connector.common_args(Path::new("/tmp/lgtv-test.ctl"));
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "9922");
        assert!(args.contains(&"ControlPath=/tmp/lgtv-test.ctl".to_string()));
    }
}
