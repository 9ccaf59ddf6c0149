//! Preflight checks run before a downgrade session touches the TV.

mod catalog;
pub mod device;
mod ssh;

use crate::models::config::Config;
use crate::Result;
use colored::Colorize;
use std::net::IpAddr;

/// Outcome level of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    /// Usable, but degraded. Does not block a session.
    Warn,
    Fail,
}

#[derive(Debug)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub message: String,
    pub hint: Option<String>,
}

impl CheckResult {
    pub fn ok(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Ok,
            message: message.into(),
            hint: None,
        }
    }

    pub fn warn(name: &'static str, message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Warn,
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    pub fn fail(name: &'static str, message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    pub fn passed(&self) -> bool {
        self.status != CheckStatus::Fail
    }
}

/// Run the checks a session depends on: the ssh toolchain, credentials,
/// the firmware catalog and, given a TV, its Developer Mode app.
pub async fn run_preflight_checks(config: &Config, tv: Option<IpAddr>) -> Result<Vec<CheckResult>> {
    let mut results = vec![
        ssh::check(&config.remote),
        ssh::check_credentials(&config.remote),
        catalog::check(config).await,
    ];
    if let Some(address) = tv {
        results.push(device::check(config, address).await?);
    }
    Ok(results)
}

pub fn print_results(results: &[CheckResult]) {
    for result in results {
        let tag = match result.status {
            CheckStatus::Ok => "[OK]".green(),
            CheckStatus::Warn => "[WARN]".yellow(),
            CheckStatus::Fail => "[FAIL]".red(),
        };
        println!("{} {}: {}", tag, result.name.bold(), result.message);
        if let Some(hint) = result.hint.as_deref().filter(|_| result.status != CheckStatus::Ok) {
            println!("  {} {}", "->".yellow(), hint);
        }
    }
}

/// True when nothing failed. Warnings pass.
pub fn all_passed(results: &[CheckResult]) -> bool {
    results.iter().all(CheckResult::passed)
}
