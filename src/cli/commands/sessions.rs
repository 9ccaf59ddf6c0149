//! Sessions command implementation.
//!
//! Reads session reports stored in ~/.config/lgtv_downgrade/sessions/

use crate::core::session::{list_session_dirs, load_report, REPORT_FILE};
use crate::models::config::Config;
use crate::models::session::SessionState;
use crate::Result;
use colored::Colorize;

/// List all sessions.
pub async fn list_sessions(config: &Config) -> Result<()> {
    println!("{}", "📁 Sessions".bold().cyan());
    println!();

    let sessions_dir = &config.sessions_dir;
    let sessions = list_session_dirs(sessions_dir)?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!(
        "{:<25} {:<16} {:<22} {:<12} {}",
        "Session ID".bold(),
        "Device".bold(),
        "Firmware".bold(),
        "State".bold(),
        "Reason".bold()
    );
    println!("{}", "-".repeat(100));

    for dir in sessions {
        let session_id = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let report_path = dir.join(REPORT_FILE);

        if !report_path.exists() {
            println!("{:<25} {}", session_id, "(no session.json)".yellow());
            continue;
        }

        match load_report(&report_path) {
            Ok(report) => {
                let state = match report.state {
                    SessionState::Succeeded => report.state.to_string().green(),
                    SessionState::Failed => report.state.to_string().red(),
                    _ => report.state.to_string().yellow(),
                };
                println!(
                    "{:<25} {:<16} {:<22} {:<12} {}",
                    session_id,
                    report.device.address.to_string(),
                    format!(
                        "{} -> {}",
                        report.pre_downgrade_version.as_deref().unwrap_or("?"),
                        report.release.version
                    ),
                    state,
                    report.failure.map(|f| f.to_string()).unwrap_or_default()
                );
            }
            Err(_) => {
                println!("{:<25} {}", session_id, "(corrupted)".red());
            }
        }
    }

    println!();
    println!("Sessions directory: {}", sessions_dir.display());

    Ok(())
}

/// Show details of a specific session.
pub async fn show_session(config: &Config, session_id: &str) -> Result<()> {
    println!("{} {}", "📋 Session:".bold().cyan(), session_id);
    println!();

    let session_dir = config.sessions_dir.join(session_id);
    let report_path = session_dir.join(REPORT_FILE);

    if !report_path.exists() {
        return Err(crate::Error::PathNotFound(format!(
            "Session not found: {}",
            session_id
        )));
    }

    let report = load_report(&report_path)?;

    println!("{}", "Session Details:".bold());
    println!("  {} {}", "Started:".bold(), report.started_at);
    if let Some(finished) = report.finished_at {
        println!("  {} {}", "Finished:".bold(), finished);
    }
    println!(
        "  {} {} ({})",
        "Device:".bold(),
        report.device.address,
        report.device.model_label()
    );
    println!(
        "  {} {} -> {}",
        "Firmware:".bold(),
        report.pre_downgrade_version.as_deref().unwrap_or("?"),
        report.release.version
    );
    println!("  {} {}", "State:".bold(), report.state);
    if let Some(failure) = &report.failure {
        println!("  {} {}", "Reason:".bold(), failure.to_string().red());
    }
    println!("  {} {}", "Triggers sent:".bold(), report.triggers_issued);
    if let Some(payload) = &report.payload {
        println!("  {} {}", "Payload:".bold(), payload.path.display());
    }
    println!();

    if !report.attempts.is_empty() {
        println!("{}", "Attempts:".bold());
        for (state, count) in &report.attempts {
            println!("  {:<34} {}", state.to_string(), count);
        }
        println!();
    }

    println!("{}", "Events:".bold());
    for event in &report.events {
        println!(
            "  {} [{} #{}] {}",
            event.at.format("%H:%M:%S"),
            event.state,
            event.attempt,
            event.message
        );
    }

    println!();
    println!("Session directory: {}", session_dir.display());

    Ok(())
}
