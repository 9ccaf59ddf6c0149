//! Staged payload model.

use super::firmware::FirmwareRelease;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A firmware image written to removable media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedPayload {
    /// Release the image belongs to.
    pub release: FirmwareRelease,
    /// Media mount point.
    pub media_root: PathBuf,
    /// Final path of the image on the media.
    pub path: PathBuf,
    /// SHA-256 of the bytes present on the media.
    pub sha256: String,
    /// Image size in bytes.
    pub size_bytes: u64,
    /// Whether `sha256` was recomputed from the media after the write.
    pub verified: bool,
    /// When staging completed.
    pub staged_at: DateTime<Utc>,
}

/// Why staging failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingErrorKind {
    /// Not enough free space on the media.
    InsufficientSpace,
    /// Media went away mid-operation.
    MediaRemoved,
    /// Bytes on the media do not match the known-good checksum.
    ChecksumMismatch,
    /// Media filesystem is not one the TV can read.
    UnrecognizedFilesystem,
    /// Media is read-only or permission was denied.
    NotWritable,
    /// The source image is missing.
    SourceMissing,
    /// Transient I/O failure.
    Io,
}

impl StagingErrorKind {
    /// Whether the caller may retry staging.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StagingErrorKind::MediaRemoved | StagingErrorKind::Io)
    }
}

impl fmt::Display for StagingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StagingErrorKind::InsufficientSpace => "insufficient space",
            StagingErrorKind::MediaRemoved => "media removed",
            StagingErrorKind::ChecksumMismatch => "checksum mismatch",
            StagingErrorKind::UnrecognizedFilesystem => "unrecognized filesystem",
            StagingErrorKind::NotWritable => "media not writable",
            StagingErrorKind::SourceMissing => "source image missing",
            StagingErrorKind::Io => "I/O error",
        };
        write!(f, "{}", s)
    }
}
