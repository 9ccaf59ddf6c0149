//! File system utilities.

use std::path::Path;

/// Smallest size a genuine webOS firmware image is expected to have.
pub const MIN_FIRMWARE_SIZE: u64 = 100 * 1024 * 1024;

/// Get file extension in lowercase.
pub fn get_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Check if a file looks like a webOS firmware image based on extension.
pub fn is_firmware_image(path: &Path) -> bool {
    get_extension(path)
        .map(|ext| ext == "epk")
        .unwrap_or(false)
}

/// File name component as an owned string.
pub fn file_name_string(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().to_string())
}

/// Human readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
