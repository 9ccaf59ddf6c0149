//! Configuration model.
//!
//! Loaded from `~/.config/lgtv_downgrade/config.toml`. Every section and
//! field is optional; missing values fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the catalog URL.
pub const CATALOG_URL_ENV: &str = "LGTV_CATALOG_URL";

/// Default environment variable holding the SSH password.
pub const DEFAULT_PASSWORD_ENV: &str = "LGTV_SSH_PASSWORD";

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Discovery configuration.
    pub discovery: DiscoveryConfig,
    /// Remote session configuration.
    pub remote: RemoteConfig,
    /// Firmware catalog configuration.
    pub catalog: CatalogConfig,
    /// Payload staging configuration.
    pub staging: StagingConfig,
    /// Backoff between retries.
    pub retry: RetryConfig,
    /// Session attempt bounds.
    pub session: SessionLimits,
    /// Reboot detection windows.
    pub reboot: RebootConfig,
    /// Expert-mode confirmation wait.
    pub confirmation: ConfirmationConfig,
    /// Sessions directory.
    pub sessions_dir: PathBuf,
    /// Local firmware cache directory.
    pub firmware_dir: PathBuf,
}

/// Discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Range to scan. Defaults to the local /24.
    pub network: Option<String>,
    /// Port probed for reachability.
    pub port: u16,
    /// Per-address probe timeout in milliseconds.
    pub probe_timeout_ms: u64,
    /// Whole-scan timeout in seconds.
    pub scan_timeout_secs: u64,
    /// Concurrent probes.
    pub concurrency: usize,
    /// Query model and firmware over SSH for reachable devices.
    pub identify: bool,
}

/// Mode the vendor update app is launched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    Expert,
    User,
}

impl UpdateMode {
    /// Value passed to the update app.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateMode::Expert => "expert",
            UpdateMode::User => "user",
        }
    }
}

/// Remote session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// SSH port of the developer-mode endpoint.
    pub port: u16,
    /// SSH user.
    pub user: String,
    /// Private key for key-based authentication.
    pub identity_file: Option<PathBuf>,
    /// Environment variable holding a password. Password auth is used when it is set.
    pub password_env: Option<String>,
    /// ssh executable.
    pub ssh_program: String,
    /// Channel setup timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Per-command timeout in seconds.
    pub command_timeout_secs: u64,
    /// Update app mode.
    pub update_mode: UpdateMode,
    /// Response pattern meaning a command succeeded.
    pub accept_pattern: String,
    /// Response pattern meaning the device shows a confirmation prompt.
    pub confirm_pattern: String,
    /// Status response pattern meaning an update is already running.
    pub in_progress_pattern: String,
}

/// Firmware catalog configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// HTTP(S) URL of the catalog document.
    pub url: Option<String>,
    /// Local catalog file (JSON or TOML).
    pub file: Option<PathBuf>,
    /// Request timeout in seconds.
    pub request_timeout_secs: Option<u64>,
}

/// Payload staging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Directory at the media root the TV scans for images.
    pub directory_name: String,
    /// Filesystem types the TV can read. Empty accepts anything.
    pub accepted_filesystems: Vec<String>,
    /// In-place copy retries for transient I/O errors.
    pub max_copy_attempts: u32,
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// First delay in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Attempts for idempotent operations.
    pub max_attempts: u32,
    /// Randomise delays.
    pub jitter: bool,
}

/// Session attempt bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLimits {
    /// Staging attempts before `StagingFailed`.
    pub max_staging_attempts: u32,
    /// Submit attempts before `NoDeviceResponse`.
    pub max_submit_attempts: u32,
}

/// Reboot detection windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebootConfig {
    /// How long to wait for the device to drop off the network.
    pub down_timeout_secs: u64,
    /// How long to wait for it to come back.
    pub up_timeout_secs: u64,
    /// Reachability poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

/// Expert-mode confirmation wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// How long to wait for the operator to confirm on the TV.
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let base = dirs_config_path();
        Self {
            discovery: DiscoveryConfig::default(),
            remote: RemoteConfig::default(),
            catalog: CatalogConfig::default(),
            staging: StagingConfig::default(),
            retry: RetryConfig::default(),
            session: SessionLimits::default(),
            reboot: RebootConfig::default(),
            confirmation: ConfirmationConfig::default(),
            sessions_dir: base.join("sessions"),
            firmware_dir: base.join("firmware"),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            network: None,
            port: 9922,
            probe_timeout_ms: 1500,
            scan_timeout_secs: 30,
            concurrency: 64,
            identify: true,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            port: 9922,
            user: "prisoner".to_string(),
            identity_file: None,
            password_env: Some(DEFAULT_PASSWORD_ENV.to_string()),
            ssh_program: "ssh".to_string(),
            connect_timeout_secs: 10,
            command_timeout_secs: 30,
            update_mode: UpdateMode::Expert,
            accept_pattern: r#""returnValue"\s*:\s*true"#.to_string(),
            confirm_pattern: r#"(?i)"(needConfirm|confirmRequired|expertModeConfirm)"\s*:\s*true"#
                .to_string(),
            in_progress_pattern: r#"(?i)"(updateInProgress|isUpdating|downloading)"\s*:\s*true"#
                .to_string(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            directory_name: "LG_DTV".to_string(),
            accepted_filesystems: ["vfat", "msdos", "exfat", "ntfs", "ntfs3", "fuseblk", "msdosfs"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_copy_attempts: 3,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_staging_attempts: 3,
            max_submit_attempts: 3,
        }
    }
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            down_timeout_secs: 180,
            up_timeout_secs: 600,
            poll_interval_ms: 3000,
        }
    }
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

impl DiscoveryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

impl RemoteConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// The password, when password authentication is configured and the variable is set.
    pub fn password(&self) -> Option<String> {
        self.password_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|p| !p.is_empty())
    }
}

impl CatalogConfig {
    /// Catalog URL, with the environment taking precedence.
    pub fn effective_url(&self) -> Option<String> {
        std::env::var(CATALOG_URL_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| self.url.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(20))
    }
}

impl RebootConfig {
    pub fn down_timeout(&self) -> Duration {
        Duration::from_secs(self.down_timeout_secs)
    }

    pub fn up_timeout(&self) -> Duration {
        Duration::from_secs(self.up_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ConfirmationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Get the configuration directory path.
pub fn dirs_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lgtv_downgrade")
}

/// Load configuration from the default location.
pub fn load_config() -> Config {
    load_config_from(&dirs_config_path().join("config.toml"))
}

/// Load configuration from `path`, falling back to defaults.
pub fn load_config_from(path: &Path) -> Config {
    if path.exists() {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => return config,
                Err(e) => tracing::warn!("Ignoring invalid config {:?}: {}", path, e),
            },
            Err(e) => tracing::warn!("Cannot read config {:?}: {}", path, e),
        }
    }

    Config::default()
}
