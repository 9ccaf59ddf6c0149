//! Firmware catalog queries.
//!
//! Maps a device model to the firmware releases known to apply to it. The
//! catalog keeps the last document it fetched successfully; a failing source
//! never makes lookups fail, it only makes them stale.

use crate::models::config::Config;
use crate::models::firmware::{CatalogDocument, CatalogModel, Confidence, FirmwareRelease};
use crate::services::catalog::{source_from_config, CatalogSource};
use crate::utils::version::FirmwareVersion;
use crate::Result;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Snapshot file name inside the firmware directory.
pub const SNAPSHOT_FILE: &str = "catalog.json";

/// Firmware catalog.
pub struct FirmwareCatalog {
    source: Option<Arc<dyn CatalogSource>>,
    snapshot: CatalogDocument,
    cache_path: Option<PathBuf>,
}

impl FirmwareCatalog {
    /// Create a catalog backed by `source`, seeded from the cached snapshot if present.
    pub fn new(source: Option<Arc<dyn CatalogSource>>, cache_path: Option<PathBuf>) -> Self {
        let snapshot = cache_path
            .as_ref()
            .and_then(|path| load_snapshot(path))
            .unwrap_or_default();
        Self {
            source,
            snapshot,
            cache_path,
        }
    }

    /// A catalog over a fixed document.
    pub fn from_document(doc: CatalogDocument) -> Self {
        Self {
            source: None,
            snapshot: doc,
            cache_path: None,
        }
    }

    /// Create the catalog configured in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let source = source_from_config(&config.catalog)?;
        Ok(Self::new(source, Some(config.firmware_dir.join(SNAPSHOT_FILE))))
    }

    /// Re-fetch the document from the source.
    ///
    /// Returns true when a fresh document was loaded. On failure the previous
    /// snapshot stays in use.
    pub async fn refresh(&mut self) -> bool {
        let Some(source) = self.source.clone() else {
            tracing::debug!("No catalog source configured");
            return false;
        };

        match source.fetch().await {
            Ok(doc) => {
                tracing::info!(
                    "Catalog refreshed from {} ({} models)",
                    source.describe(),
                    doc.models.len()
                );
                if let Some(path) = &self.cache_path {
                    if let Err(e) = save_snapshot(&doc, path) {
                        tracing::warn!("Cannot cache catalog snapshot {:?}: {}", path, e);
                    }
                }
                self.snapshot = doc;
                true
            }
            Err(e) => {
                tracing::warn!(
                    "Catalog source {} unavailable, using {} cached models: {}",
                    source.describe(),
                    self.snapshot.models.len(),
                    e
                );
                false
            }
        }
    }

    /// Releases compatible with `model`, newest first.
    ///
    /// Exact model entries win; model-family matches are only used when no
    /// exact entry exists.
    pub fn releases_for(&self, model: &str) -> Vec<FirmwareRelease> {
        let wanted = normalize_model(model);
        if wanted.is_empty() {
            return Vec::new();
        }

        let exact: Vec<&CatalogModel> = self
            .snapshot
            .models
            .iter()
            .filter(|m| normalize_model(&m.model) == wanted)
            .collect();

        let (entries, confidence) = if exact.is_empty() {
            let family: Vec<&CatalogModel> = self
                .snapshot
                .models
                .iter()
                .filter(|m| family_matches(m, &wanted))
                .collect();
            if !family.is_empty() {
                tracing::debug!("No exact catalog entry for {}, using model family", wanted);
            }
            (family, Confidence::InferredFromModelFamily)
        } else {
            (exact, Confidence::Exact)
        };

        let mut releases: Vec<FirmwareRelease> = entries
            .iter()
            .flat_map(|entry| {
                entry
                    .releases
                    .iter()
                    .map(|r| r.to_release(&entry.model, confidence))
            })
            .collect();

        // Newest first; for equal versions keep the most confident entry.
        releases.sort_by(|a, b| b.version.cmp(&a.version).then(a.confidence.cmp(&b.confidence)));
        let mut seen = HashSet::new();
        releases.retain(|r| seen.insert(r.version.canonical()));
        releases
    }

    /// The release of `model` with exactly `version`.
    pub fn resolve(&self, model: &str, version: &FirmwareVersion) -> Result<FirmwareRelease> {
        self.releases_for(model)
            .into_iter()
            .find(|r| &r.version == version)
            .ok_or_else(|| crate::Error::FirmwareNotFound {
                model: model.to_string(),
                version: version.to_string(),
            })
    }

    /// Best downgrade target for a device on `current`.
    ///
    /// The newest release older than `current`, preferring releases known
    /// to be rootable.
    pub fn recommend(&self, model: &str, current: &FirmwareVersion) -> Option<FirmwareRelease> {
        let older: Vec<FirmwareRelease> = self
            .releases_for(model)
            .into_iter()
            .filter(|r| r.version.is_older_than(current))
            .collect();

        older
            .iter()
            .find(|r| r.rootable == Some(true))
            .or_else(|| older.iter().find(|r| r.rootable != Some(false)))
            .or_else(|| older.first())
            .cloned()
    }

    /// Number of models in the current snapshot.
    pub fn model_count(&self) -> usize {
        self.snapshot.models.len()
    }
}

fn family_matches(entry: &CatalogModel, wanted: &str) -> bool {
    entry.families.iter().any(|family| {
        let family = normalize_model(family);
        !family.is_empty() && wanted.contains(&family)
    })
}

/// Normalize a model identifier: upper-case, `LG-`/`LG` prefix removed.
pub fn normalize_model(model: &str) -> String {
    let upper = model.trim().to_uppercase();
    let stripped = upper
        .strip_prefix("LG-")
        .or_else(|| {
            upper
                .strip_prefix("LG")
                .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        })
        .unwrap_or(&upper);
    stripped.trim().to_string()
}

/// Base model number used for manual vendor-site searches.
pub fn model_base(model: &str) -> String {
    static BASE_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let normalized = normalize_model(model);
    let base = BASE_RE
        .get_or_init(|| Regex::new(r"^[A-Z0-9]{6,15}").ok())
        .as_ref()
        .and_then(|re| re.find(&normalized))
        .map(|m| m.as_str().to_string());
    base.unwrap_or(normalized)
}

fn load_snapshot(path: &Path) -> Option<CatalogDocument> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(doc) => Some(doc),
        Err(e) => {
            tracing::warn!("Ignoring corrupt catalog snapshot {:?}: {}", path, e);
            None
        }
    }
}

fn save_snapshot(doc: &CatalogDocument, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(doc)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_model() {
        assert_eq!(normalize_model("lg-43up75006lf"), "43UP75006LF");
        assert_eq!(normalize_model("LG43UP75006LF"), "43UP75006LF");
        assert_eq!(normalize_model(" OLED55CX6LA "), "OLED55CX6LA");
    }

    #[test]
    fn test_model_base() {
        assert_eq!(model_base("43UP75006LF.AEU"), "43UP75006LF");
        assert_eq!(model_base("LG-55NANO"), "55NANO");
    }
}
