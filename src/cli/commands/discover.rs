//! Discover command implementation.

use crate::core::discovery::Discovery;
use crate::models::config::Config;
use crate::models::device::Device;
use crate::utils::netrange::NetworkRange;
use crate::Result;
use colored::Colorize;
use futures::StreamExt;
use std::time::Duration;

/// Scan the network and print every reachable TV.
pub async fn discover(
    config: &Config,
    network: Option<&str>,
    timeout_secs: Option<u64>,
    no_identify: bool,
) -> Result<()> {
    let range = match network.or(config.discovery.network.as_deref()) {
        Some(spec) => NetworkRange::parse(spec)?,
        None => NetworkRange::local_default()?,
    };
    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.discovery.scan_timeout());
    let identify = config.discovery.identify && !no_identify;

    println!(
        "{} {} ({} addresses, timeout {:?})",
        "📡 Scanning".bold().cyan(),
        range,
        range.len(),
        timeout
    );
    println!();

    let discovery = Discovery::from_config(config, identify)?;
    let mut devices = discovery.scan(&range, timeout);
    let mut found: Vec<Device> = Vec::new();

    println!(
        "{:<16} {:<20} {}",
        "Address".bold(),
        "Model".bold(),
        "Firmware".bold()
    );
    println!("{}", "-".repeat(50));

    while let Some(device) = devices.next().await {
        println!(
            "{:<16} {:<20} {}",
            device.address.to_string(),
            device.model_label(),
            device.firmware_label()
        );
        found.push(device);
    }

    println!();
    if found.is_empty() {
        println!("{}", "No devices found.".yellow());
        println!("Make sure the TV is on, on the same network, and Developer Mode SSH is enabled.");
    } else {
        println!("Found {} device(s)", found.len());
    }

    Ok(())
}
