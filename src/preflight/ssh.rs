//! SSH client and credential checks.

use super::CheckResult;
use crate::models::config::RemoteConfig;
use crate::services::ssh::SshConnector;

/// Check that the ssh client is installed.
pub fn check(config: &RemoteConfig) -> CheckResult {
    if SshConnector::is_installed(&config.ssh_program) {
        CheckResult::ok("ssh", format!("installed ({})", config.ssh_program))
    } else {
        CheckResult::fail(
            "ssh",
            "not found",
            "Install OpenSSH: sudo apt install openssh-client",
        )
    }
}

/// Check the configured way of authenticating.
///
/// A password needs sshpass; an identity file must exist. With neither, ssh
/// falls back to the agent and default keys, which only earns a warning.
pub fn check_credentials(config: &RemoteConfig) -> CheckResult {
    if config.password().is_some() {
        return if SshConnector::is_sshpass_installed() {
            CheckResult::ok("sshpass", "installed")
        } else {
            CheckResult::fail(
                "sshpass",
                "not found, but a password is configured",
                "Install sshpass: sudo apt install sshpass, or use key authentication",
            )
        };
    }

    match &config.identity_file {
        Some(path) if path.is_file() => CheckResult::ok("SSH key", path.display().to_string()),
        Some(path) => CheckResult::fail(
            "SSH key",
            format!("{} does not exist", path.display()),
            "Fix [remote] identity_file in config.toml",
        ),
        None => CheckResult::warn(
            "SSH key",
            "no identity file or password configured",
            "Relying on ssh-agent and default keys",
        ),
    }
}
