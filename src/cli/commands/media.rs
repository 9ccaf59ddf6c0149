//! Media command implementation.

use crate::core::media::list_removable_media;
use crate::models::config::Config;
use crate::utils::fs::format_bytes;
use crate::Result;
use colored::Colorize;

/// List mounted removable volumes.
pub async fn list(config: &Config) -> Result<()> {
    println!("{}", "💾 Removable media".bold().cyan());
    println!();

    let media = list_removable_media(&config.staging.accepted_filesystems);
    if media.is_empty() {
        println!("No removable media found.");
        println!("Accepted filesystems: {}", config.staging.accepted_filesystems.join(", "));
        return Ok(());
    }

    println!(
        "{:<40} {:<10} {}",
        "Mount point".bold(),
        "FS".bold(),
        "Free".bold()
    );
    println!("{}", "-".repeat(62));
    for candidate in media {
        println!(
            "{:<40} {:<10} {}",
            candidate.mount_point.display().to_string(),
            candidate.filesystem.as_deref().unwrap_or("?"),
            candidate
                .available_bytes
                .map(format_bytes)
                .unwrap_or_else(|| "?".to_string())
        );
    }

    Ok(())
}
