//! Firmware catalog preflight check.

use super::CheckResult;
use crate::core::catalog::SNAPSHOT_FILE;
use crate::models::config::Config;
use crate::services::catalog::source_from_config;

/// Check that the configured catalog source can be fetched.
///
/// An unreachable source only warns when a cached snapshot exists.
pub async fn check(config: &Config) -> CheckResult {
    let cached = config.firmware_dir.join(SNAPSHOT_FILE).is_file();
    let source = match source_from_config(&config.catalog) {
        Ok(Some(source)) => source,
        Ok(None) if cached => {
            return CheckResult::warn(
                "Firmware catalog",
                "no source configured, using cached snapshot",
                "Set [catalog] url or file in config.toml to refresh it",
            )
        }
        Ok(None) => {
            return CheckResult::fail(
                "Firmware catalog",
                "no catalog source configured",
                "Set [catalog] url or file in config.toml, or LGTV_CATALOG_URL",
            )
        }
        Err(e) => {
            return CheckResult::fail(
                "Firmware catalog",
                e.to_string(),
                "Check the [catalog] section of config.toml",
            )
        }
    };

    match source.fetch().await {
        Ok(doc) => CheckResult::ok(
            "Firmware catalog",
            format!("{} ({} models)", source.describe(), doc.models.len()),
        ),
        Err(_) if cached => CheckResult::warn(
            "Firmware catalog",
            format!("{} unreachable, using cached snapshot", source.describe()),
            "Releases published since the last refresh will be missing",
        ),
        Err(_) => CheckResult::fail(
            "Firmware catalog",
            format!("cannot fetch {}", source.describe()),
            "Check your network connection or the catalog URL",
        ),
    }
}
