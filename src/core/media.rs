//! Removable media inspection.

use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Where removable media get mounted on Linux desktops.
const LINUX_MEDIA_ROOTS: &[&str] = &["/media", "/run/media", "/mnt"];

/// Where macOS mounts volumes.
const MACOS_VOLUMES: &str = "/Volumes";

/// Free space and filesystem queries for a media path.
pub trait MediaInspector: Send + Sync {
    /// Bytes available to unprivileged writers.
    fn available_space(&self, path: &Path) -> io::Result<u64>;

    /// Filesystem type of the mount holding `path`, if it can be determined.
    fn filesystem_type(&self, path: &Path) -> Option<String>;
}

/// Inspector backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInspector;

impl MediaInspector for SystemInspector {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        fs4::available_space(path)
    }

    fn filesystem_type(&self, path: &Path) -> Option<String> {
        let table = std::fs::read_to_string("/proc/mounts").ok()?;
        let path = path.canonicalize().ok()?;
        mount_for(&parse_mount_table(&table), &path).map(|m| m.filesystem.clone())
    }
}

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
    pub filesystem: String,
}

/// Parse `/proc/mounts` content.
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let filesystem = fields.next()?;
            Some(MountEntry {
                device: device.to_string(),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                filesystem: filesystem.to_string(),
            })
        })
        .collect()
}

/// Decode the octal escapes (`\040` for space) used in the mount table.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// The mount entry with the longest mount point that contains `path`.
pub fn mount_for<'a>(entries: &'a [MountEntry], path: &Path) -> Option<&'a MountEntry> {
    entries
        .iter()
        .filter(|e| path.starts_with(&e.mount_point))
        .max_by_key(|e| e.mount_point.as_os_str().len())
}

/// A mounted volume the image could be staged on.
#[derive(Debug, Clone)]
pub struct MediaCandidate {
    pub mount_point: PathBuf,
    pub filesystem: Option<String>,
    pub available_bytes: Option<u64>,
}

/// List mounted removable volumes.
///
/// On Linux this reads the mount table and keeps mounts under the usual
/// removable-media roots. On macOS it lists `/Volumes`.
pub fn list_removable_media(accepted_filesystems: &[String]) -> Vec<MediaCandidate> {
    let inspector = SystemInspector;

    if let Ok(table) = std::fs::read_to_string("/proc/mounts") {
        return removable_from_table(&parse_mount_table(&table), accepted_filesystems)
            .into_iter()
            .map(|entry| MediaCandidate {
                available_bytes: inspector.available_space(&entry.mount_point).ok(),
                filesystem: Some(entry.filesystem),
                mount_point: entry.mount_point,
            })
            .collect();
    }

    let volumes = Path::new(MACOS_VOLUMES);
    if !volumes.is_dir() {
        return Vec::new();
    }

    WalkDir::new(volumes)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        // The boot volume is a symlink back to /.
        .filter(|e| !e.path_is_symlink())
        .map(|e| MediaCandidate {
            available_bytes: inspector.available_space(e.path()).ok(),
            filesystem: None,
            mount_point: e.into_path(),
        })
        .collect()
}

/// Mount entries that look like removable media with an accepted filesystem.
pub fn removable_from_table(entries: &[MountEntry], accepted_filesystems: &[String]) -> Vec<MountEntry> {
    entries
        .iter()
        .filter(|e| {
            LINUX_MEDIA_ROOTS
                .iter()
                .any(|root| e.mount_point.starts_with(root) && e.mount_point != Path::new(root))
        })
        .filter(|e| {
            accepted_filesystems.is_empty()
                || accepted_filesystems
                    .iter()
                    .any(|fs| fs.eq_ignore_ascii_case(&e.filesystem))
        })
        .cloned()
        .collect()
}
