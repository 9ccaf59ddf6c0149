//! Session command implementation.

use super::{load_catalog, resolve_image};
use crate::core::discovery::Discovery;
use crate::core::locks::{DeviceLocks, MediaLocks};
use crate::core::session::{save_report, DowngradeSession, SessionConfig, SessionDeps, SessionInputs};
use crate::core::stager::Stager;
use crate::models::config::Config;
use crate::models::session::{SessionReport, SessionState, SessionStatus};
use crate::services::remote::Credentials;
use crate::services::ssh::SshConnector;
use crate::utils::version::FirmwareVersion;
use crate::Result;
use colored::Colorize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Options of `session run`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub ip: IpAddr,
    pub version: Option<String>,
    pub media: PathBuf,
    pub model: Option<String>,
    pub current_firmware: Option<String>,
    pub image: Option<PathBuf>,
}

/// Run one downgrade session and return the process exit code.
pub async fn run(config: &Config, options: RunOptions, cancel: CancellationToken) -> Result<i32> {
    println!("{} {}", "📺 Downgrade session for".bold().cyan(), options.ip);
    println!();

    let discovery = Discovery::from_config(config, true)?;
    let mut device = discovery.probe(options.ip).await;
    if let Some(model) = &options.model {
        device.model = Some(model.clone());
    }
    if let Some(current) = &options.current_firmware {
        device.firmware = Some(FirmwareVersion::parse(current)?);
    }

    let model = device.model.clone().ok_or_else(|| {
        crate::Error::other("Cannot determine the TV model; pass --model")
    })?;
    let current = device.firmware.clone().ok_or_else(|| {
        crate::Error::other("Cannot determine the current firmware; pass --current-firmware")
    })?;

    let catalog = load_catalog(config).await?;
    let release = match &options.version {
        Some(version) => catalog.resolve(&model, &FirmwareVersion::parse(version)?)?,
        None => catalog.recommend(&model, &current).ok_or_else(|| {
            crate::Error::NoCompatibleFirmware(format!(
                "no release older than {} for {}",
                current, model
            ))
        })?,
    };

    println!("  {} {}", "Model:".bold(), model);
    println!("  {} {} -> {}", "Firmware:".bold(), current, release.version);
    println!("  {} {}", "Media:".bold(), options.media.display());
    println!();

    let image = resolve_image(config, &release, options.image.as_deref()).await?;
    let session = DowngradeSession::new(device, release, SessionConfig::from_config(config)?)?;

    let deps = SessionDeps {
        discovery,
        connector: Arc::new(SshConnector::new(config.remote.clone())),
        stager: Arc::new(Stager::new(config.staging.clone(), MediaLocks::new()).with_progress(true)),
        device_locks: DeviceLocks::new(),
    };
    let inputs = SessionInputs {
        credentials: Credentials::from_config(&config.remote),
        media_root: options.media,
        image,
    };

    let mut status = session.subscribe();
    let printer = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            match current {
                SessionStatus::InProgress(state) => println!("{} {}", "->".cyan(), state),
                SessionStatus::WaitingOnDeviceConfirmation => println!(
                    "{} {}",
                    "->".yellow(),
                    "Confirm the update on the TV screen (press OK on the remote)".yellow().bold()
                ),
                SessionStatus::Finished(_) => break,
            }
        }
    });

    let report = session.run(&deps, &inputs, &cancel).await;
    printer.abort();

    let path = save_report(&report, &config.sessions_dir)?;
    print_summary(&report);
    println!("Report: {}", path.display());

    Ok(report.state.exit_code())
}

fn print_summary(report: &SessionReport) {
    println!();
    match report.state {
        SessionState::Succeeded => println!(
            "{} device now runs {}",
            "✅ Downgrade succeeded:".green().bold(),
            report.release.version
        ),
        SessionState::Abandoned => println!("{}", "⚠️  Session abandoned".yellow().bold()),
        _ => println!(
            "{} {}",
            "❌ Session failed:".red().bold(),
            report
                .failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_else(|| report.state.to_string())
        ),
    }
    if let Some(event) = report.events.last() {
        println!("  {}", event.message);
    }
    println!("  {} {}", "Triggers sent:".bold(), report.triggers_issued);
    println!();
}
