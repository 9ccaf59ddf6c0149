//! Error types for the downgrade orchestrator.

use crate::models::payload::StagingErrorKind;
use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the downgrade orchestrator.
#[derive(Error, Debug)]
pub enum Error {
    // Preflight errors
    #[error("ssh client not found. Install OpenSSH: sudo apt install openssh-client")]
    SshClientNotFound,

    #[error("sshpass not found but password authentication is configured. Install sshpass")]
    SshpassNotFound,

    // Discovery errors
    #[error("No device found at {0}")]
    DiscoveryTimeout(String),

    #[error("Invalid network range: {0}")]
    InvalidNetworkRange(String),

    // Catalog errors
    #[error("Invalid firmware version: {0}")]
    InvalidVersion(String),

    #[error("Firmware {version} not found for model {model}")]
    FirmwareNotFound { model: String, version: String },

    #[error("No compatible firmware: {0}")]
    NoCompatibleFirmware(String),

    #[error("Catalog source unavailable: {0}")]
    CatalogUnavailable(String),

    // Staging errors
    #[error("Staging failed ({kind}): {detail}")]
    StagingFailed {
        kind: StagingErrorKind,
        detail: String,
    },

    // Remote session errors
    #[error("Authentication failed for {0}")]
    Authentication(String),

    #[error("Device unreachable: {0}")]
    Unreachable(String),

    #[error("Remote protocol error: {0}")]
    Protocol(String),

    #[error("Invalid response pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    // Session errors
    #[error("Firmware {target} is not older than the device's current firmware {current}")]
    NotADowngrade { target: String, current: String },

    #[error("Another session is already active for device {0}")]
    DeviceBusy(String),

    #[error("Operation cancelled")]
    Cancelled,

    // File system errors
    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // TOML errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a generic error from a string.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Error::Other(msg.into())
    }

    /// Create a staging error of the given kind.
    pub fn staging<S: Into<String>>(kind: StagingErrorKind, detail: S) -> Self {
        Error::StagingFailed {
            kind,
            detail: detail.into(),
        }
    }

    /// Whether repeating the failed operation could succeed.
    ///
    /// Only meaningful for idempotent operations; state-changing remote
    /// commands are never retried on this signal alone.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::StagingFailed { kind, .. } => kind.is_retryable(),
            Error::DiscoveryTimeout(_) | Error::Unreachable(_) | Error::Io(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}
