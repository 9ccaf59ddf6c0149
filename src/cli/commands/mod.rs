//! CLI command implementations.

pub mod discover;
pub mod firmware;
pub mod media;
pub mod session;
pub mod sessions;
pub mod stage;
pub mod status;

use crate::core::catalog::FirmwareCatalog;
use crate::core::fetcher::ImageFetcher;
use crate::models::config::Config;
use crate::models::firmware::FirmwareRelease;
use crate::Result;
use std::path::{Path, PathBuf};

/// Load the catalog, refreshing it from its source when possible.
///
/// An unreachable source with nothing cached yields an empty catalog, so
/// lookups report no releases instead of failing.
pub(crate) async fn load_catalog(config: &Config) -> Result<FirmwareCatalog> {
    let mut catalog = FirmwareCatalog::from_config(config)?;
    if !catalog.refresh().await && catalog.model_count() == 0 {
        tracing::warn!("Firmware catalog is empty: no source reachable and no cached snapshot");
    }
    Ok(catalog)
}

/// Local image for `release`: the operator's file, or the fetched locator.
pub(crate) async fn resolve_image(
    config: &Config,
    release: &FirmwareRelease,
    image: Option<&Path>,
) -> Result<PathBuf> {
    match image {
        Some(path) => Ok(path.to_path_buf()),
        None => ImageFetcher::new(config.firmware_dir.clone())?.fetch(release).await,
    }
}
