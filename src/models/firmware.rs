//! Firmware release and catalog document models.

use crate::utils::version::FirmwareVersion;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How certain a catalog match is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// The release lists the device's exact model.
    Exact,
    /// Matched through a model-family substring.
    InferredFromModelFamily,
    /// The catalog itself flags the release as unconfirmed.
    Unverified,
}

impl Confidence {
    /// Whether callers should warn before using a release with this tag.
    pub fn needs_warning(&self) -> bool {
        *self != Confidence::Exact
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Exact => write!(f, "exact"),
            Confidence::InferredFromModelFamily => write!(f, "inferred (model family)"),
            Confidence::Unverified => write!(f, "unverified"),
        }
    }
}

/// A firmware image applicable to one or more models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareRelease {
    /// Model identifiers this release applies to.
    pub models: Vec<String>,
    /// Release version.
    pub version: FirmwareVersion,
    /// Where the image can be fetched (URL or local path).
    pub locator: String,
    /// Expected SHA-256 of the image, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Expected image size in bytes, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Match confidence.
    pub confidence: Confidence,
    /// Whether the release is known to accept the root exploit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootable: Option<bool>,
}

impl FirmwareRelease {
    /// File name of the image, taken from the locator.
    pub fn image_name(&self) -> String {
        let tail = self
            .locator
            .split(['?', '#'])
            .next()
            .unwrap_or(&self.locator)
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.locator);
        urlencoding::decode(tail)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| tail.to_string())
    }
}

/// Catalog source document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub models: Vec<CatalogModel>,
}

/// One model entry in the catalog source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogModel {
    /// Model identifier.
    pub model: String,
    /// Model-family substrings that share this firmware line.
    #[serde(default)]
    pub families: Vec<String>,
    /// Known releases, any order.
    #[serde(default)]
    pub releases: Vec<CatalogRelease>,
}

/// A release as recorded in the catalog source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRelease {
    pub version: FirmwareVersion,
    pub locator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootable: Option<bool>,
    #[serde(default)]
    pub unverified: bool,
}

impl CatalogRelease {
    /// Build a release tagged for `model`.
    pub fn to_release(&self, model: &str, matched: Confidence) -> FirmwareRelease {
        let confidence = if self.unverified {
            Confidence::Unverified
        } else {
            matched
        };
        FirmwareRelease {
            models: vec![model.to_string()],
            version: self.version.clone(),
            locator: self.locator.clone(),
            sha256: self.sha256.clone(),
            size_bytes: self.size_bytes,
            confidence,
            rootable: self.rootable,
        }
    }
}
