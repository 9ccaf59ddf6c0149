//! Remote command channel abstractions.
//!
//! A [`RemoteConnector`] opens a [`RemoteSession`] to one device. Sessions
//! never retry on their own: only the orchestrator knows whether a command
//! is safe to repeat.

use crate::models::config::RemoteConfig;
use crate::models::device::Device;
use crate::services::luna::LunaCommand;
use crate::Result;
use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Credentials for the device's management endpoint.
#[derive(Clone)]
pub enum Credentials {
    /// Public key authentication. Uses the ssh agent/default keys when no file is given.
    Key {
        user: String,
        identity_file: Option<PathBuf>,
    },
    /// Password authentication.
    Password { user: String, password: String },
}

impl Credentials {
    /// Build credentials from configuration and the environment.
    pub fn from_config(config: &RemoteConfig) -> Self {
        match config.password() {
            Some(password) => Credentials::Password {
                user: config.user.clone(),
                password,
            },
            None => Credentials::Key {
                user: config.user.clone(),
                identity_file: config.identity_file.clone(),
            },
        }
    }

    pub fn user(&self) -> &str {
        match self {
            Credentials::Key { user, .. } | Credentials::Password { user, .. } => user,
        }
    }

    pub fn uses_password(&self) -> bool {
        matches!(self, Credentials::Password { .. })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Key { user, identity_file } => f
                .debug_struct("Key")
                .field("user", user)
                .field("identity_file", identity_file)
                .finish(),
            Credentials::Password { user, .. } => f
                .debug_struct("Password")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Patterns a command response is matched against.
#[derive(Debug, Clone)]
pub struct ResponsePatterns {
    /// Success.
    pub accept: Regex,
    /// Device is showing a confirmation prompt. Checked before `accept`.
    pub confirm: Option<Regex>,
}

impl ResponsePatterns {
    /// Compile patterns from strings.
    pub fn new(accept: &str, confirm: Option<&str>) -> Result<Self> {
        Ok(Self {
            accept: Regex::new(accept)?,
            confirm: confirm.map(Regex::new).transpose()?,
        })
    }

    /// Classify a response body.
    pub fn classify(&self, response: &str) -> CommandOutcome {
        if let Some(confirm) = &self.confirm {
            if confirm.is_match(response) {
                return CommandOutcome::ConfirmationRequired(response.to_string());
            }
        }
        if self.accept.is_match(response) {
            CommandOutcome::Accepted(response.to_string())
        } else {
            CommandOutcome::Rejected(response.to_string())
        }
    }
}

/// Result of running one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The response matched the accept pattern.
    Accepted(String),
    /// The device asked for on-screen confirmation.
    ConfirmationRequired(String),
    /// The device answered, but not with success.
    Rejected(String),
    /// No answer within the command timeout. The device may or may not have acted.
    Timeout,
}

impl CommandOutcome {
    /// Response body, if the device answered.
    pub fn response(&self) -> Option<&str> {
        match self {
            CommandOutcome::Accepted(r)
            | CommandOutcome::ConfirmationRequired(r)
            | CommandOutcome::Rejected(r) => Some(r),
            CommandOutcome::Timeout => None,
        }
    }
}

/// An open command channel to one device.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run a command and classify its response.
    ///
    /// Returns `Err(Cancelled)` if `cancel` fires; the in-flight command is
    /// torn down. Channel failures surface as `Unreachable` or `Protocol`.
    async fn run(
        &mut self,
        command: &LunaCommand,
        patterns: &ResponsePatterns,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome>;

    /// Close the channel. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}

/// Opens remote sessions.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Open an authenticated channel.
    ///
    /// Fails with `Authentication`, `Unreachable` or `Protocol`.
    async fn open(&self, device: &Device, credentials: &Credentials)
        -> Result<Box<dyn RemoteSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_checks_confirmation_first() {
        let patterns = ResponsePatterns::new(
            r#""returnValue"\s*:\s*true"#,
            Some(r#""needConfirm"\s*:\s*true"#),
        )
        .unwrap();

        assert!(matches!(
            patterns.classify(r#"{"returnValue": true, "needConfirm": true}"#),
            CommandOutcome::ConfirmationRequired(_)
        ));
        assert!(matches!(
            patterns.classify(r#"{"returnValue": true}"#),
            CommandOutcome::Accepted(_)
        ));
        assert!(matches!(
            patterns.classify(r#"{"returnValue": false, "errorText": "denied"}"#),
            CommandOutcome::Rejected(_)
        ));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::Password {
            user: "root".to_string(),
            password: "alpine".to_string(),
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("alpine"));
        assert!(printed.contains("root"));
    }
}
