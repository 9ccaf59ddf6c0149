//! Payload staging.
//!
//! Copies a firmware image to `<media>/LG_DTV/<image name>`. The copy goes
//! to a `.part` file first and is only renamed to its final name once it is
//! complete, synced and its digest recomputed from the media matches the
//! source. An interrupted copy can therefore never be mistaken for a
//! finished image, and a later run resumes the `.part` file when its prefix
//! is still intact.

use crate::core::locks::MediaLocks;
use crate::core::media::{MediaInspector, SystemInspector};
use crate::models::config::StagingConfig;
use crate::models::firmware::FirmwareRelease;
use crate::models::payload::{StagedPayload, StagingErrorKind};
use crate::utils::fs::{file_name_string, format_bytes, is_firmware_image, MIN_FIRMWARE_SIZE};
use crate::utils::hash::{digests_match, sha256_file};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const COPY_BUF_SIZE: usize = 1024 * 1024;

/// errno values shared by Linux and macOS.
const ENOSPC: i32 = 28;
const EROFS: i32 = 30;

/// Writes firmware images to removable media.
pub struct Stager {
    config: StagingConfig,
    inspector: Arc<dyn MediaInspector>,
    media_locks: MediaLocks,
    show_progress: bool,
}

impl Stager {
    pub fn new(config: StagingConfig, media_locks: MediaLocks) -> Self {
        Self::with_inspector(config, Arc::new(SystemInspector), media_locks)
    }

    pub fn with_inspector(
        config: StagingConfig,
        inspector: Arc<dyn MediaInspector>,
        media_locks: MediaLocks,
    ) -> Self {
        Self {
            config,
            inspector,
            media_locks,
            show_progress: false,
        }
    }

    /// Show a progress bar while copying.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Directory the TV scans on `media_root`.
    pub fn staging_dir(&self, media_root: &Path) -> PathBuf {
        media_root.join(&self.config.directory_name)
    }

    /// Stage `source` for `release` onto `media_root`.
    ///
    /// Holds the media lock for the whole operation. If a verified copy of
    /// the same image is already present, nothing is written.
    pub async fn stage(
        &self,
        release: &FirmwareRelease,
        source: &Path,
        media_root: &Path,
    ) -> Result<StagedPayload> {
        // Aliases of one mount point share a lock.
        let lock_key = fs::canonicalize(media_root).unwrap_or_else(|_| media_root.to_path_buf());
        let _lease = self.media_locks.acquire(&lock_key).await;

        let job = StageJob {
            config: self.config.clone(),
            inspector: Arc::clone(&self.inspector),
            release: release.clone(),
            source: source.to_path_buf(),
            media_root: media_root.to_path_buf(),
            show_progress: self.show_progress,
        };

        tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| Error::other(format!("Staging task failed: {}", e)))?
    }

    /// Re-check a staged payload against the media currently mounted.
    ///
    /// Returns false when the file is gone or its bytes changed, e.g. after
    /// the media was swapped.
    pub fn verify(&self, payload: &StagedPayload) -> Result<bool> {
        let meta = match fs::metadata(&payload.path) {
            Ok(meta) if meta.is_file() => meta,
            _ => return Ok(false),
        };
        if meta.len() != payload.size_bytes {
            return Ok(false);
        }

        let actual = sha256_file(&payload.path)?;
        let declared_ok = payload
            .release
            .sha256
            .as_deref()
            .map(|expected| digests_match(expected, &actual))
            .unwrap_or(true);
        Ok(declared_ok && digests_match(&payload.sha256, &actual))
    }
}

/// One staging run, executed on the blocking pool.
struct StageJob {
    config: StagingConfig,
    inspector: Arc<dyn MediaInspector>,
    release: FirmwareRelease,
    source: PathBuf,
    media_root: PathBuf,
    show_progress: bool,
}

impl StageJob {
    /// Every failure leaves as a `StagingFailed` with a kind.
    fn run(self) -> Result<StagedPayload> {
        self.stage().map_err(|e| match e {
            Error::ChecksumMismatch { path, expected, actual } => Error::staging(
                StagingErrorKind::ChecksumMismatch,
                format!("{}: expected {}, read back {}", path, expected, actual),
            ),
            Error::Io(io) => self.media_error(io, "I/O error"),
            other => other,
        })
    }

    fn stage(&self) -> Result<StagedPayload> {
        let source_size = self.check_source()?;
        self.check_media()?;

        let dir = self.media_root.join(&self.config.directory_name);
        let file_name = file_name_string(&self.source).unwrap_or_else(|| self.release.image_name());
        let final_path = dir.join(&file_name);
        let part_path = part_path_for(&final_path);

        // A same-size image may already be the one we want.
        let mut source_digest = None;
        if fs::metadata(&final_path).map(|m| m.len()).ok() == Some(source_size) {
            let digest = self.source_digest()?;
            let on_media = sha256_file(&final_path).map_err(|e| self.wrap(e))?;
            if digests_match(&on_media, &digest) {
                tracing::info!("Already staged, skipping copy: {:?}", final_path);
                let _ = fs::remove_file(&part_path);
                return Ok(self.payload(final_path, on_media, source_size));
            }
            tracing::warn!("Replacing stale image at {:?}", final_path);
            source_digest = Some(digest);
        }

        // A stale image stays in place until the rename, so only a valid
        // .part prefix reduces what has to fit.
        let mut resume_from =
            resumable_prefix(&self.source, &part_path, source_size).map_err(|e| self.wrap(e))?;
        self.check_space(source_size - resume_from)?;

        let source_digest = match source_digest {
            Some(digest) => digest,
            None => self.source_digest()?,
        };

        fs::create_dir_all(&dir).map_err(|e| self.media_error(e, "cannot create staging directory"))?;
        self.check_writable(&dir)?;

        let attempts = self.config.max_copy_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                resume_from = resumable_prefix(&self.source, &part_path, source_size)
                    .map_err(|e| self.wrap(e))?;
                self.check_space(source_size - resume_from)?;
            }
            match self.copy_and_verify(&part_path, source_size, resume_from, &source_digest) {
                Ok(digest) => {
                    fs::rename(&part_path, &final_path)
                        .map_err(|e| self.media_error(e, "cannot rename staged image"))?;
                    sync_dir(&dir);
                    tracing::info!(
                        "Staged {} ({}) -> {:?}",
                        file_name,
                        format_bytes(source_size),
                        final_path
                    );
                    return Ok(self.payload(final_path, digest, source_size));
                }
                Err(e) if attempt < attempts && is_copy_retryable(&e) => {
                    tracing::warn!("Copy attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::staging(StagingErrorKind::Io, "copy failed")))
    }

    /// SHA-256 of the source, checked against the release's declared digest.
    fn source_digest(&self) -> Result<String> {
        let digest = sha256_file(&self.source)?;
        if let Some(expected) = &self.release.sha256 {
            if !digests_match(expected, &digest) {
                return Err(Error::staging(
                    StagingErrorKind::ChecksumMismatch,
                    format!(
                        "source image {:?} does not match the release checksum (expected {}, got {})",
                        self.source, expected, digest
                    ),
                ));
            }
        }
        Ok(digest)
    }

    fn check_source(&self) -> Result<u64> {
        let meta = match fs::metadata(&self.source) {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                return Err(Error::staging(
                    StagingErrorKind::SourceMissing,
                    format!("{:?} is not a file", self.source),
                ))
            }
        };
        let size = meta.len();

        if !is_firmware_image(&self.source) {
            tracing::warn!("{:?} does not have the .epk extension", self.source);
        }
        if size < MIN_FIRMWARE_SIZE {
            tracing::warn!(
                "Firmware image seems small: {} (expected at least {})",
                format_bytes(size),
                format_bytes(MIN_FIRMWARE_SIZE)
            );
        }

        if let Some(expected) = self.release.size_bytes {
            if expected != size {
                return Err(Error::staging(
                    StagingErrorKind::ChecksumMismatch,
                    format!(
                        "source image {:?} is {} bytes, release declares {}",
                        self.source, size, expected
                    ),
                ));
            }
        }

        Ok(size)
    }

    fn check_media(&self) -> Result<()> {
        if !self.media_root.exists() {
            return Err(Error::staging(
                StagingErrorKind::MediaRemoved,
                format!("{:?} is not mounted", self.media_root),
            ));
        }
        if !self.media_root.is_dir() {
            return Err(Error::staging(
                StagingErrorKind::NotWritable,
                format!("{:?} is not a directory", self.media_root),
            ));
        }

        if self.config.accepted_filesystems.is_empty() {
            return Ok(());
        }
        match self.inspector.filesystem_type(&self.media_root) {
            Some(fs_type) => {
                let accepted = self
                    .config
                    .accepted_filesystems
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(&fs_type));
                if !accepted {
                    return Err(Error::staging(
                        StagingErrorKind::UnrecognizedFilesystem,
                        format!(
                            "{:?} is {}; the TV reads {}",
                            self.media_root,
                            fs_type,
                            self.config.accepted_filesystems.join(", ")
                        ),
                    ));
                }
                tracing::debug!("Media filesystem: {}", fs_type);
            }
            None => {
                tracing::warn!(
                    "Cannot determine filesystem of {:?}; make sure the TV can read it",
                    self.media_root
                );
            }
        }
        Ok(())
    }

    fn check_writable(&self, dir: &Path) -> Result<()> {
        let probe = dir.join(".lgtv-write-test");
        File::create(&probe)
            .and_then(|mut f| f.write_all(b"ok"))
            .map_err(|e| self.media_error(e, "media is not writable"))?;
        let _ = fs::remove_file(&probe);
        Ok(())
    }

    fn check_space(&self, needed: u64) -> Result<()> {
        if needed == 0 {
            return Ok(());
        }
        let available = self
            .inspector
            .available_space(&self.media_root)
            .map_err(|e| self.media_error(e, "cannot query free space"))?;
        if available < needed {
            return Err(Error::staging(
                StagingErrorKind::InsufficientSpace,
                format!(
                    "{:?} has {} free, {} needed",
                    self.media_root,
                    format_bytes(available),
                    format_bytes(needed)
                ),
            ));
        }
        Ok(())
    }

    /// Copy into the `.part` file and return the digest read back from the media.
    fn copy_and_verify(
        &self,
        part_path: &Path,
        total: u64,
        resume_from: u64,
        source_digest: &str,
    ) -> Result<String> {
        if resume_from > 0 {
            tracing::info!("Resuming partial copy at {}", format_bytes(resume_from));
        }

        let pb = self.progress_bar(total, resume_from);
        let mut source = File::open(&self.source).map_err(|_| {
            Error::staging(StagingErrorKind::SourceMissing, format!("{:?} vanished", self.source))
        })?;
        source.seek(SeekFrom::Start(resume_from))?;

        let copied = copy_into_part(&mut source, part_path, resume_from, pb.as_ref());
        if let Some(pb) = &pb {
            pb.finish_and_clear();
        }
        copied.map_err(|e| self.wrap(e))?;

        let on_media = sha256_file(part_path).map_err(|e| self.wrap(e))?;
        if !digests_match(&on_media, source_digest) {
            let _ = fs::remove_file(part_path);
            return Err(Error::ChecksumMismatch {
                path: part_path.display().to_string(),
                expected: source_digest.to_string(),
                actual: on_media,
            });
        }

        Ok(on_media)
    }

    /// `staged_at` is the image's modification time, so re-staging an
    /// existing image reports the payload it originally produced.
    fn payload(&self, path: PathBuf, sha256: String, size_bytes: u64) -> StagedPayload {
        let staged_at = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        StagedPayload {
            release: self.release.clone(),
            media_root: self.media_root.clone(),
            path,
            sha256,
            size_bytes,
            verified: true,
            staged_at,
        }
    }

    fn progress_bar(&self, total: u64, position: u64) -> Option<ProgressBar> {
        if !self.show_progress {
            return None;
        }
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb.set_position(position);
        Some(pb)
    }

    /// Map an error raised while touching the media.
    fn wrap(&self, err: Error) -> Error {
        match err {
            Error::Io(e) => self.media_error(e, "I/O error"),
            other => other,
        }
    }

    fn media_error(&self, err: io::Error, what: &str) -> Error {
        let kind = if !self.media_root.exists() {
            StagingErrorKind::MediaRemoved
        } else {
            match (err.kind(), err.raw_os_error()) {
                (io::ErrorKind::PermissionDenied, _) | (_, Some(EROFS)) => StagingErrorKind::NotWritable,
                (_, Some(ENOSPC)) => StagingErrorKind::InsufficientSpace,
                (io::ErrorKind::NotFound, _) => StagingErrorKind::MediaRemoved,
                _ => StagingErrorKind::Io,
            }
        };
        Error::staging(kind, format!("{}: {}", what, err))
    }
}

/// A copy that read back wrong is worth another attempt; so is transient I/O.
fn is_copy_retryable(err: &Error) -> bool {
    matches!(err, Error::ChecksumMismatch { .. })
        || matches!(err, Error::StagingFailed { kind: StagingErrorKind::Io, .. })
}

/// `<final name>.part` next to the final path.
pub fn part_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

/// Length of the `.part` prefix that matches the source, or 0.
///
/// A mismatching or oversized partial file is discarded.
fn resumable_prefix(source: &Path, part: &Path, total: u64) -> Result<u64> {
    let len = match fs::metadata(part) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(0),
    };
    if len == 0 || len > total {
        let _ = fs::remove_file(part);
        return Ok(0);
    }

    let mut a = File::open(source)?;
    let mut b = File::open(part)?;
    let mut buf_a = vec![0u8; COPY_BUF_SIZE];
    let mut buf_b = vec![0u8; COPY_BUF_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(COPY_BUF_SIZE as u64) as usize;
        a.read_exact(&mut buf_a[..n])?;
        b.read_exact(&mut buf_b[..n])?;
        if buf_a[..n] != buf_b[..n] {
            tracing::warn!("Partial copy {:?} does not match the source, starting over", part);
            drop(b);
            let _ = fs::remove_file(part);
            return Ok(0);
        }
        remaining -= n as u64;
    }
    Ok(len)
}

/// Append everything from `reader` to `part`, starting at `resume_from`, then fsync.
///
/// Only ever writes to `part`; the caller renames it once the copy is verified.
pub(crate) fn copy_into_part<R: Read>(
    reader: &mut R,
    part: &Path,
    resume_from: u64,
    pb: Option<&ProgressBar>,
) -> Result<u64> {
    let mut out = OpenOptions::new().create(true).write(true).truncate(false).open(part)?;
    out.set_len(resume_from)?;
    out.seek(SeekFrom::Start(resume_from))?;

    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written = resume_from;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        out.write_all(&buf[..n])?;
        written += n as u64;
        if let Some(pb) = pb {
            pb.set_position(written);
        }
    }

    out.flush()?;
    out.sync_all()?;
    Ok(written)
}

/// Persist the rename. Not every filesystem supports syncing directories.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
