//! Resolve a release locator to a local image file.
//!
//! Local paths and `file://` locators are used in place. HTTP(S) images are
//! downloaded into the firmware cache directory and reused on later runs
//! when their checksum (or size) still matches the release.

use crate::models::firmware::FirmwareRelease;
use crate::utils::fs::{file_name_string, is_firmware_image};
use crate::utils::hash::{digests_match, sha256_file, to_hex};
use crate::Result;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

/// Fetches firmware images into the local cache.
pub struct ImageFetcher {
    client: reqwest::Client,
    firmware_dir: PathBuf,
}

impl ImageFetcher {
    pub fn new(firmware_dir: PathBuf) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("lgtv_downgrade/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            firmware_dir,
        })
    }

    /// Local path of the image for `release`, downloading it if needed.
    pub async fn fetch(&self, release: &FirmwareRelease) -> Result<PathBuf> {
        if let Some(path) = local_path(&release.locator) {
            if !path.is_file() {
                return Err(crate::Error::PathNotFound(path.display().to_string()));
            }
            return Ok(path);
        }

        if let Some(cached) = self.find_cached(release)? {
            tracing::info!("Using cached firmware: {:?}", cached);
            return Ok(cached);
        }

        self.download(release).await
    }

    /// A cached image that matches `release`, if any.
    pub fn find_cached(&self, release: &FirmwareRelease) -> Result<Option<PathBuf>> {
        if !self.firmware_dir.is_dir() {
            return Ok(None);
        }

        let by_name = self.firmware_dir.join(release.image_name());
        if by_name.is_file() && cache_entry_matches(&by_name, release)? {
            return Ok(Some(by_name));
        }

        // Older downloads may carry a different name but include the version.
        let version = release.version.as_str();
        for entry in WalkDir::new(&self.firmware_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            let name = file_name_string(path).unwrap_or_default();
            if is_firmware_image(path) && name.contains(version) && cache_entry_matches(path, release)? {
                return Ok(Some(path.to_path_buf()));
            }
        }

        Ok(None)
    }

    async fn download(&self, release: &FirmwareRelease) -> Result<PathBuf> {
        fs::create_dir_all(&self.firmware_dir)?;
        let target = self.firmware_dir.join(release.image_name());
        let part = target.with_extension("part");

        tracing::info!("Downloading {} -> {:?}", release.locator, target);

        let mut response = self.client.get(&release.locator).send().await?;
        if !response.status().is_success() {
            return Err(crate::Error::other(format!(
                "Download of {} failed: {}",
                release.locator,
                response.status()
            )));
        }

        let total = response.content_length().or(release.size_bytes);
        let pb = self.progress_bar(total);

        let mut file = tokio::fs::File::create(&part).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            pb.set_position(written);
        }
        file.sync_all().await?;
        drop(file);

        pb.finish_and_clear();

        let actual = to_hex(hasher);
        if let Some(expected) = &release.sha256 {
            if !digests_match(expected, &actual) {
                let _ = fs::remove_file(&part);
                return Err(crate::Error::ChecksumMismatch {
                    path: target.display().to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        fs::rename(&part, &target)?;
        tracing::info!("Downloaded {} bytes: {:?}", written, target);
        Ok(target)
    }

    fn progress_bar(&self, total: Option<u64>) -> ProgressBar {
        let pb = match total {
            Some(len) => ProgressBar::new(len),
            None => ProgressBar::new_spinner(),
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    }
}

/// The local file a locator points at, if it is not a remote URL.
pub fn local_path(locator: &str) -> Option<PathBuf> {
    if let Some(path) = locator.strip_prefix("file://") {
        let decoded = urlencoding::decode(path)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| path.to_string());
        return Some(PathBuf::from(decoded));
    }
    if locator.contains("://") {
        return None;
    }
    Some(PathBuf::from(locator))
}

fn cache_entry_matches(path: &Path, release: &FirmwareRelease) -> Result<bool> {
    if let Some(expected) = &release.sha256 {
        return Ok(digests_match(expected, &sha256_file(path)?));
    }
    if let Some(size) = release.size_bytes {
        return Ok(fs::metadata(path)?.len() == size);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_path() {
        assert_eq!(local_path("/srv/fw/a.epk"), Some(PathBuf::from("/srv/fw/a.epk")));
        assert_eq!(local_path("file:///srv/fw/my%20a.epk"), Some(PathBuf::from("/srv/fw/my a.epk")));
        assert_eq!(local_path("https://example.com/a.epk"), None);
    }
}
