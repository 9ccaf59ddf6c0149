//! Stage command implementation.
//!
//! Writes the image to the USB drive without opening a session with the TV.

use super::{load_catalog, resolve_image};
use crate::core::locks::MediaLocks;
use crate::core::stager::Stager;
use crate::models::config::Config;
use crate::utils::fs::format_bytes;
use crate::utils::version::FirmwareVersion;
use crate::Result;
use colored::Colorize;
use std::path::Path;

/// Stage the image for `model`/`version` onto `media`.
pub async fn stage(
    config: &Config,
    model: &str,
    version: &str,
    media: &Path,
    image: Option<&Path>,
) -> Result<()> {
    let version = FirmwareVersion::parse(version)?;
    let catalog = load_catalog(config).await?;
    let release = catalog.resolve(model, &version)?;

    println!(
        "{} {} {} -> {}",
        "💾 Staging".bold().cyan(),
        model,
        release.version,
        media.display()
    );
    if release.confidence.needs_warning() {
        println!(
            "{} release matched with {} confidence",
            "Warning:".yellow().bold(),
            release.confidence
        );
    }
    println!();

    let source = resolve_image(config, &release, image).await?;
    let stager = Stager::new(config.staging.clone(), MediaLocks::new()).with_progress(true);
    let payload = stager.stage(&release, &source, media).await?;

    println!("{}", "Staged successfully".green().bold());
    println!("  {} {}", "File:".bold(), payload.path.display());
    println!("  {} {}", "Size:".bold(), format_bytes(payload.size_bytes));
    println!("  {} {}", "SHA-256:".bold(), payload.sha256);
    println!();
    println!("Plug the drive into the TV before starting a session.");

    Ok(())
}
