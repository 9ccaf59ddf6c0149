//! Dotted numeric firmware versions.
//!
//! webOS reports versions with zero padding (`03.21.30`) while release notes
//! usually drop it (`3.21.30`). Both compare equal here.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A dotted numeric version such as `3.21.30`.
///
/// Ordering is numeric per component. Missing trailing components compare
/// as zero, so `3.21` == `3.21.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FirmwareVersion {
    components: Vec<u32>,
    raw: String,
}

impl FirmwareVersion {
    /// Parse a version string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let raw = s.trim();
        let trimmed = raw.trim_start_matches(['v', 'V']);
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidVersion(s.to_string()));
        }

        let components = trimmed
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| crate::Error::InvalidVersion(s.to_string()))?;

        Ok(Self {
            components,
            raw: raw.to_string(),
        })
    }

    /// Numeric components.
    pub fn components(&self) -> &[u32] {
        &self.components
    }

    /// The string this version was parsed from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Canonical form without zero padding.
    pub fn canonical(&self) -> String {
        self.components
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// True when `self` is strictly older than `other`.
    pub fn is_older_than(&self, other: &FirmwareVersion) -> bool {
        self < other
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).copied().unwrap_or(0);
            let b = other.components.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FirmwareVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FirmwareVersion {}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for FirmwareVersion {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FirmwareVersion {
    type Error = crate::Error;

    fn try_from(s: String) -> crate::Result<Self> {
        Self::parse(&s)
    }
}

impl From<FirmwareVersion> for String {
    fn from(v: FirmwareVersion) -> Self {
        v.raw
    }
}
