//! Status command implementation.

use crate::core::discovery::Discovery;
use crate::models::config::Config;
use crate::preflight;
use crate::Result;
use colored::Colorize;
use std::net::IpAddr;

/// Probe one TV and print what is known about it.
pub async fn status(config: &Config, ip: IpAddr) -> Result<()> {
    let discovery = Discovery::from_config(config, true)?;
    let device = discovery.probe(ip).await;

    println!("{} {}", "📺 Device".bold().cyan(), device.address);
    println!();

    let reachability = if device.is_reachable() {
        device.reachability.to_string().green()
    } else {
        device.reachability.to_string().red()
    };
    println!("  {} {}", "Reachability:".bold(), reachability);
    println!("  {} {}", "Model:".bold(), device.model_label());
    println!("  {} {}", "Firmware:".bold(), device.firmware_label());
    if let Some(serial) = &device.serial {
        println!("  {} {}", "Serial:".bold(), serial);
    }

    if device.is_reachable() {
        println!();
        let check = preflight::device::check(config, ip).await?;
        preflight::print_results(std::slice::from_ref(&check));
    }

    Ok(())
}
