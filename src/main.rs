//! LG TV Downgrade CLI
//!
//! A command-line tool for rolling LG webOS TVs back to an older firmware.

use clap::Parser;
use lgtv_downgrade::cli::{
    args::{Cli, Commands, FirmwareAction, MediaAction, SessionAction, SessionsAction},
    commands::{discover, firmware, media, session, sessions, stage, status},
};
use lgtv_downgrade::models::config::{load_config, load_config_from, Config};
use lgtv_downgrade::preflight;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    };

    // Ctrl-C abandons a running session cleanly
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, abandoning...");
                cancel.cancel();
            }
        });
    }

    // Run the appropriate command
    match cli.command {
        Commands::Discover {
            network,
            timeout,
            no_identify,
        } => {
            discover::discover(&config, network.as_deref(), timeout, no_identify).await?;
        }

        Commands::Firmware { action } => match action {
            FirmwareAction::List {
                model,
                rootable_only,
                refresh,
            } => {
                firmware::list(&config, &model, rootable_only, refresh).await?;
            }
            FirmwareAction::Resolve { model, version } => {
                firmware::resolve(&config, &model, &version).await?;
            }
        },

        Commands::Media { action } => match action {
            MediaAction::List => {
                media::list(&config).await?;
            }
        },

        Commands::Stage {
            model,
            version,
            media,
            image,
        } => {
            stage::stage(&config, &model, &version, &media, image.as_deref()).await?;
        }

        Commands::Session { action } => match action {
            SessionAction::Run {
                ip,
                version,
                media,
                model,
                current_firmware,
                image,
            } => {
                // Run preflight checks unless skipped
                if !cli.skip_preflight {
                    run_preflight_checks(&config, ip).await?;
                }

                let options = session::RunOptions {
                    ip,
                    version,
                    media,
                    model,
                    current_firmware,
                    image,
                };
                let code = session::run(&config, options, cancel).await?;
                if code != 0 {
                    std::process::exit(code);
                }
            }
        },

        Commands::Sessions { action } => match action {
            SessionsAction::List => {
                sessions::list_sessions(&config).await?;
            }
            SessionsAction::Show { session_id } => {
                sessions::show_session(&config, &session_id).await?;
            }
        },

        Commands::Status { ip } => {
            status::status(&config, ip).await?;
        }
    }

    Ok(())
}

/// Initialize the logging system.
fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("lgtv_downgrade=debug")
        } else {
            EnvFilter::new("lgtv_downgrade=info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

/// Run preflight checks and exit if any fail.
async fn run_preflight_checks(config: &Config, tv: std::net::IpAddr) -> anyhow::Result<()> {
    use colored::Colorize;

    println!("{}", "Running preflight checks...".bold());
    println!();

    let results = preflight::run_preflight_checks(config, Some(tv)).await?;
    preflight::print_results(&results);

    println!();

    if !preflight::all_passed(&results) {
        anyhow::bail!("Preflight checks failed. Fix the issues above and try again.");
    }

    Ok(())
}
