//! Command line argument definitions.

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

/// LG TV Downgrade - Roll webOS TVs back to an older firmware
#[derive(Parser, Debug)]
#[command(name = "lgtv-downgrade")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip preflight checks
    #[arg(long, global = true)]
    pub skip_preflight: bool,

    /// Configuration file (default: ~/.config/lgtv_downgrade/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan the local network for TVs
    Discover {
        /// Range to scan, e.g. 192.168.1.0/24 or 192.168.1.10-192.168.1.60
        #[arg(short, long)]
        network: Option<String>,

        /// Whole-scan timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Only check reachability, do not query model and firmware
        #[arg(long)]
        no_identify: bool,
    },

    /// Query the firmware catalog
    Firmware {
        #[command(subcommand)]
        action: FirmwareAction,
    },

    /// Removable media
    Media {
        #[command(subcommand)]
        action: MediaAction,
    },

    /// Stage a firmware image on removable media without touching the TV
    Stage {
        /// TV model, e.g. OLED55CX6LA
        #[arg(short, long)]
        model: String,

        /// Target firmware version
        #[arg(long = "firmware", value_name = "VERSION")]
        version: String,

        /// Mount point of the USB drive
        #[arg(long, value_name = "PATH")]
        media: PathBuf,

        /// Use this local image instead of the catalog locator
        #[arg(long, value_name = "FILE")]
        image: Option<PathBuf>,
    },

    /// Run a downgrade session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Manage saved session reports
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },

    /// Show reachability, model and firmware of one TV
    Status {
        /// TV address
        #[arg(value_name = "IP")]
        ip: IpAddr,
    },
}

#[derive(Subcommand, Debug)]
pub enum FirmwareAction {
    /// List releases for a model, newest first
    List {
        /// TV model
        #[arg(value_name = "MODEL")]
        model: String,

        /// Only show releases known to be rootable
        #[arg(long)]
        rootable_only: bool,

        /// Refresh the catalog from its source first
        #[arg(long)]
        refresh: bool,
    },

    /// Resolve one release for a model
    Resolve {
        /// TV model
        #[arg(value_name = "MODEL")]
        model: String,

        /// Firmware version
        #[arg(value_name = "VERSION")]
        version: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum MediaAction {
    /// List mounted removable volumes
    List,
}

#[derive(Subcommand, Debug)]
pub enum SessionAction {
    /// Stage, trigger and verify a downgrade on one TV
    Run {
        /// TV address
        #[arg(value_name = "IP")]
        ip: IpAddr,

        /// Target firmware version (default: recommended release)
        #[arg(long = "firmware", value_name = "VERSION")]
        version: Option<String>,

        /// Mount point of the USB drive plugged into the TV
        #[arg(long, value_name = "PATH")]
        media: PathBuf,

        /// TV model, if it cannot be queried
        #[arg(short, long)]
        model: Option<String>,

        /// Current firmware, if it cannot be queried
        #[arg(long, value_name = "VERSION")]
        current_firmware: Option<String>,

        /// Use this local image instead of the catalog locator
        #[arg(long, value_name = "FILE")]
        image: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionsAction {
    /// List all sessions
    List,

    /// Show session details
    Show {
        /// Session ID
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },
}
