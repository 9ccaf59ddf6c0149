//! Device data model.

use crate::utils::version::FirmwareVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Reachability of a device's management endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reachability::Unknown => write!(f, "unknown"),
            Reachability::Reachable => write!(f, "reachable"),
            Reachability::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Identity fields a probe could extract. Any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub model: Option<String>,
    pub firmware: Option<FirmwareVersion>,
    pub serial: Option<String>,
}

impl DeviceIdentity {
    /// True when both model and firmware are known.
    pub fn is_complete(&self) -> bool {
        self.model.is_some() && self.firmware.is_some()
    }
}

/// A TV found on the local network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Management address.
    pub address: IpAddr,
    /// Model identifier as reported by the device (e.g. `43UP75006LF`).
    pub model: Option<String>,
    /// Serial number, if the device reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Last known firmware version.
    pub firmware: Option<FirmwareVersion>,
    /// Reachability at the last probe.
    pub reachability: Reachability,
    /// When this device was first seen.
    pub discovered_at: DateTime<Utc>,
    /// When this device was last probed.
    pub last_probed_at: Option<DateTime<Utc>>,
}

impl Device {
    /// A device known only by address.
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            model: None,
            serial: None,
            firmware: None,
            reachability: Reachability::Unknown,
            discovered_at: Utc::now(),
            last_probed_at: None,
        }
    }

    /// A device with operator-supplied identity, e.g. from the TV's settings screen.
    pub fn with_identity(address: IpAddr, model: &str, firmware: FirmwareVersion) -> Self {
        let mut device = Self::new(address);
        device.model = Some(model.to_string());
        device.firmware = Some(firmware);
        device
    }

    /// Record the result of a probe.
    ///
    /// Fields the probe could not determine keep their previous value.
    pub fn record_probe(&mut self, reachability: Reachability, identity: Option<DeviceIdentity>) {
        self.reachability = reachability;
        self.last_probed_at = Some(Utc::now());
        if let Some(identity) = identity {
            if identity.model.is_some() {
                self.model = identity.model;
            }
            if identity.firmware.is_some() {
                self.firmware = identity.firmware;
            }
            if identity.serial.is_some() {
                self.serial = identity.serial;
            }
        }
    }

    /// Whether the last probe reached the device.
    pub fn is_reachable(&self) -> bool {
        self.reachability == Reachability::Reachable
    }

    /// Whether the device's identity is fully known.
    pub fn is_identified(&self) -> bool {
        self.model.is_some() && self.firmware.is_some()
    }

    /// Model for display.
    pub fn model_label(&self) -> &str {
        self.model.as_deref().unwrap_or("unknown")
    }

    /// Firmware for display.
    pub fn firmware_label(&self) -> String {
        self.firmware
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}
