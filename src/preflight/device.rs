//! Developer Mode check against a live TV.

use super::CheckResult;
use crate::models::config::Config;
use crate::models::device::Device;
use crate::services::luna::{has_developer_mode_app, LunaCommand};
use crate::services::remote::{Credentials, RemoteConnector, ResponsePatterns};
use crate::services::ssh::SshConnector;
use crate::Result;
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const NAME: &str = "Developer Mode";

/// Check over SSH that the TV at `address` has the Developer Mode app.
pub async fn check(config: &Config, address: IpAddr) -> Result<CheckResult> {
    let connector = SshConnector::new(config.remote.clone());
    let patterns = ResponsePatterns::new(&config.remote.accept_pattern, None)?;
    Ok(check_developer_mode(
        &connector,
        &Device::new(address),
        &Credentials::from_config(&config.remote),
        &patterns,
        config.remote.command_timeout(),
    )
    .await)
}

/// List the TV's apps and look for the Developer Mode app.
///
/// Without it the `prisoner` endpoint goes away, so an SSH failure is
/// reported the same way.
pub async fn check_developer_mode(
    connector: &dyn RemoteConnector,
    device: &Device,
    credentials: &Credentials,
    patterns: &ResponsePatterns,
    timeout: Duration,
) -> CheckResult {
    let mut remote = match connector.open(device, credentials).await {
        Ok(remote) => remote,
        Err(e) => {
            return CheckResult::fail(
                NAME,
                format!("cannot open SSH to {}: {}", device.address, e),
                "Install Developer Mode from the LG Content Store, enable Key Server and use its key",
            )
        }
    };

    let outcome = remote
        .run(&LunaCommand::list_apps(), patterns, timeout, &CancellationToken::new())
        .await;
    if let Err(e) = remote.close().await {
        tracing::debug!("Closing remote session failed: {}", e);
    }

    match outcome {
        Ok(outcome) => match outcome.response() {
            Some(body) if has_developer_mode_app(body) => {
                CheckResult::ok(NAME, format!("app installed on {}", device.address))
            }
            Some(_) => CheckResult::fail(
                NAME,
                "app not found on the TV",
                "Install Developer Mode from the LG Content Store and sign in with an LG developer account",
            ),
            None => CheckResult::warn(
                NAME,
                "app list query timed out",
                "The TV may be busy; check the Developer Mode app manually",
            ),
        },
        Err(e) => CheckResult::warn(
            NAME,
            format!("cannot list apps: {}", e),
            "Check the Developer Mode app manually",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::CheckStatus;
    use crate::services::remote::{CommandOutcome, RemoteSession};
    use crate::Error;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;

    struct FakeTv {
        apps: Option<&'static str>,
    }

    struct FakeChannel {
        apps: &'static str,
    }

    #[async_trait]
    impl RemoteConnector for FakeTv {
        async fn open(&self, device: &Device, _credentials: &Credentials) -> Result<Box<dyn RemoteSession>> {
            match self.apps {
                Some(apps) => Ok(Box::new(FakeChannel { apps })),
                None => Err(Error::Authentication(device.address.to_string())),
            }
        }
    }

    #[async_trait]
    impl RemoteSession for FakeChannel {
        async fn run(
            &mut self,
            _command: &LunaCommand,
            patterns: &ResponsePatterns,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<CommandOutcome> {
            Ok(patterns.classify(self.apps))
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    async fn run_check(tv: FakeTv) -> CheckResult {
        let patterns = ResponsePatterns::new(r#""returnValue"\s*:\s*true"#, None).unwrap();
        let credentials = Credentials::Key {
            user: "prisoner".to_string(),
            identity_file: None,
        };
        check_developer_mode(
            &tv,
            &Device::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50))),
            &credentials,
            &patterns,
            Duration::from_secs(5),
        )
        .await
    }

    #[tokio::test]
    async fn test_developer_mode_installed() {
        let result = run_check(FakeTv {
            apps: Some(r#"{"returnValue":true,"apps":[{"id":"com.palmdts.devmode","title":"Developer Mode"}]}"#),
        })
        .await;
        assert_eq!(result.status, CheckStatus::Ok);
    }

    #[tokio::test]
    async fn test_developer_mode_missing() {
        let result = run_check(FakeTv {
            apps: Some(r#"{"returnValue":true,"apps":[{"id":"netflix","title":"Netflix"}]}"#),
        })
        .await;
        assert_eq!(result.status, CheckStatus::Fail);
    }

    #[tokio::test]
    async fn test_ssh_failure_fails_the_check() {
        let result = run_check(FakeTv { apps: None }).await;
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.message.contains("cannot open SSH"));
    }
}
