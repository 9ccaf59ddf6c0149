//! Firmware catalog commands.

use super::load_catalog;
use crate::core::catalog::FirmwareCatalog;
use crate::models::config::Config;
use crate::models::firmware::Confidence;
use crate::utils::fs::format_bytes;
use crate::utils::version::FirmwareVersion;
use crate::Result;
use colored::Colorize;

/// List releases for a model.
pub async fn list(config: &Config, model: &str, rootable_only: bool, refresh: bool) -> Result<()> {
    println!("{} {}", "📦 Firmware for".bold().cyan(), model);
    println!();

    let catalog = if refresh {
        load_catalog(config).await?
    } else {
        let catalog = FirmwareCatalog::from_config(config)?;
        if catalog.model_count() == 0 {
            // Nothing cached yet
            load_catalog(config).await?
        } else {
            catalog
        }
    };

    let releases: Vec<_> = catalog
        .releases_for(model)
        .into_iter()
        .filter(|r| !rootable_only || r.rootable == Some(true))
        .collect();

    if releases.is_empty() {
        println!("No releases found.");
        return Ok(());
    }

    println!(
        "{:<12} {:<10} {:<26} {:<10} {}",
        "Version".bold(),
        "Rootable".bold(),
        "Match".bold(),
        "Size".bold(),
        "Image".bold()
    );
    println!("{}", "-".repeat(90));

    for release in &releases {
        let rootable = match release.rootable {
            Some(true) => "yes".green(),
            Some(false) => "no".red(),
            None => "?".normal(),
        };
        let confidence = if release.confidence == Confidence::Exact {
            release.confidence.to_string().normal()
        } else {
            release.confidence.to_string().yellow()
        };
        println!(
            "{:<12} {:<10} {:<26} {:<10} {}",
            release.version.to_string(),
            rootable,
            confidence,
            release.size_bytes.map(format_bytes).unwrap_or_else(|| "-".to_string()),
            release.image_name()
        );
    }

    println!();
    println!("{} release(s)", releases.len());

    Ok(())
}

/// Resolve one release and print its details.
pub async fn resolve(config: &Config, model: &str, version: &str) -> Result<()> {
    let version = FirmwareVersion::parse(version)?;
    let catalog = load_catalog(config).await?;
    let release = catalog.resolve(model, &version)?;

    println!("{} {} {}", "📦 Release".bold().cyan(), model, release.version);
    println!();
    println!("  {} {}", "Locator:".bold(), release.locator);
    println!("  {} {}", "Image:".bold(), release.image_name());
    println!(
        "  {} {}",
        "SHA-256:".bold(),
        release.sha256.as_deref().unwrap_or("-")
    );
    println!(
        "  {} {}",
        "Size:".bold(),
        release.size_bytes.map(format_bytes).unwrap_or_else(|| "-".to_string())
    );
    println!("  {} {}", "Match:".bold(), release.confidence);
    if release.confidence.needs_warning() {
        println!(
            "  {} this release is not listed for {} exactly; double-check before flashing",
            "!".yellow(),
            model
        );
    }

    Ok(())
}
