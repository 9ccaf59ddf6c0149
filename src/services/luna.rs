//! webOS Luna service bus commands.
//!
//! Commands are sent through `luna-send-pub`, which is available to the
//! developer-mode `prisoner` user.

use crate::models::config::UpdateMode;
use crate::models::device::DeviceIdentity;
use crate::utils::version::FirmwareVersion;
use serde::Deserialize;
use serde_json::{json, Value};

const SYSTEM_INFO_URI: &str = "luna://com.webos.service.tvproperty/getSystemInfo";
const APP_LAUNCH_URI: &str = "luna://com.webos.applicationManager/launch";
const LIST_APPS_URI: &str = "luna://com.webos.applicationManager/listApps";
const SOFTWARE_UPDATE_APP: &str = "com.webos.app.softwareupdate";
/// Id of LG's Developer Mode app, which keeps the `prisoner` SSH endpoint alive.
const DEVELOPER_MODE_APP: &str = "com.palmdts.devmode";

/// What a command does to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Read-only; always safe to repeat.
    StatusQuery,
    /// Changes device state; never repeated without a status check.
    TriggerUpdate,
}

impl CommandKind {
    pub fn is_idempotent(&self) -> bool {
        matches!(self, CommandKind::StatusQuery)
    }
}

/// A request addressed to a Luna service method.
#[derive(Debug, Clone, PartialEq)]
pub struct LunaCommand {
    pub kind: CommandKind,
    pub uri: String,
    pub payload: Value,
}

impl LunaCommand {
    /// Query model, firmware version and serial number.
    pub fn status_query() -> Self {
        Self {
            kind: CommandKind::StatusQuery,
            uri: SYSTEM_INFO_URI.to_string(),
            payload: json!({
                "keys": ["modelName", "firmwareVersion", "serialNumber", "sdkVersion"]
            }),
        }
    }

    /// List installed apps.
    pub fn list_apps() -> Self {
        Self {
            kind: CommandKind::StatusQuery,
            uri: LIST_APPS_URI.to_string(),
            payload: json!({}),
        }
    }

    /// Launch the software update app with the update flag set.
    pub fn trigger_update(mode: UpdateMode) -> Self {
        Self {
            kind: CommandKind::TriggerUpdate,
            uri: APP_LAUNCH_URI.to_string(),
            payload: json!({
                "id": SOFTWARE_UPDATE_APP,
                "params": { "mode": mode.as_str(), "flagUpdate": true }
            }),
        }
    }

    /// Shell command line for the device.
    pub fn render(&self) -> String {
        format!(
            "luna-send-pub -n 1 -f {} {}",
            shell_quote(&self.uri),
            shell_quote(&self.payload.to_string())
        )
    }
}

/// Quote for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// `getSystemInfo` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemInfoResponse {
    #[serde(default)]
    return_value: bool,
    model_name: Option<String>,
    firmware_version: Option<String>,
    serial_number: Option<String>,
}

/// Extract device identity from a status query response.
///
/// Returns `None` when the response is not a successful system info reply.
pub fn parse_system_info(response: &str) -> Option<DeviceIdentity> {
    let body = extract_json(response)?;
    let info: SystemInfoResponse = serde_json::from_str(body).ok()?;
    if !info.return_value {
        return None;
    }

    Some(DeviceIdentity {
        model: info.model_name.filter(|m| !m.is_empty()),
        firmware: info
            .firmware_version
            .as_deref()
            .and_then(|v| FirmwareVersion::parse(v).ok()),
        serial: info.serial_number.filter(|s| !s.is_empty()),
    })
}

#[derive(Debug, Deserialize)]
struct ListAppsResponse {
    #[serde(default)]
    apps: Vec<AppInfo>,
}

#[derive(Debug, Deserialize)]
struct AppInfo {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
}

/// Whether a `listApps` response includes the Developer Mode app.
///
/// Falls back to a plain text search when the reply is not the expected JSON.
pub fn has_developer_mode_app(response: &str) -> bool {
    let parsed = extract_json(response)
        .and_then(|body| serde_json::from_str::<ListAppsResponse>(body).ok())
        .filter(|list| !list.apps.is_empty());
    match parsed {
        Some(list) => list.apps.iter().any(|app| {
            app.id == DEVELOPER_MODE_APP || app.title.to_lowercase().contains("developer")
        }),
        None => response.to_lowercase().contains("developer"),
    }
}

/// The outermost JSON object in `s`, skipping any banner text around it.
fn extract_json(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (end > start).then(|| &s[start..=end])
}
