//! Virtual filesystem probes.
//!
//! All paths are resolved below a configurable root so the kernel's view
//! (`/sys`, `/dev/disk`) can be replaced by a directory tree in tests.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

/// Handle on the host's sysfs and `/dev` trees.
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of `rel` (e.g. "sys/block/sda") below the root.
    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path(rel).exists()
    }

    /// Expand a glob pattern relative to the root, sorted lexicographically.
    pub fn glob(&self, rel_pattern: &str) -> Vec<PathBuf> {
        let root = glob::Pattern::escape(&self.root.to_string_lossy());
        let pattern = format!(
            "{}/{}",
            root.trim_end_matches('/'),
            rel_pattern.trim_start_matches('/')
        );
        let mut matches: Vec<PathBuf> = match glob::glob(&pattern) {
            Ok(paths) => paths.flatten().collect(),
            Err(e) => {
                debug!(pattern = %pattern, error = %e, "Invalid glob pattern");
                Vec::new()
            }
        };
        matches.sort();
        trace!(pattern = %pattern, count = matches.len(), "Expanded glob");
        matches
    }

    /// Read a small attribute file, trimmed. `None` if missing or unreadable.
    pub fn read_attr(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.path(rel))
            .ok()
            .map(|s| s.trim().to_string())
    }

    pub fn write_attr(&self, rel: &str, value: &str) -> io::Result<()> {
        fs::write(self.path(rel), value)
    }

    pub fn read_link(&self, rel: &str) -> Option<PathBuf> {
        fs::read_link(self.path(rel)).ok()
    }

    /// Sorted entry names of a directory; empty if it does not exist.
    pub fn list_dir(&self, rel: &str) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(self.path(rel)) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    /// Block devices known to the kernel (`/sys/block/*`).
    pub fn block_devices(&self) -> Vec<String> {
        self.list_dir("sys/block")
    }

    pub fn block_exists(&self, dev: &str) -> bool {
        self.exists(&format!("sys/block/{}", dev))
    }

    /// Raw `device/wwid` attribute of a SCSI disk.
    pub fn device_wwid(&self, dev: &str) -> Option<String> {
        self.read_attr(&format!("sys/block/{}/device/wwid", dev))
    }

    /// SCSI device state ("running", "offline", ...).
    pub fn device_state(&self, dev: &str) -> Option<String> {
        self.read_attr(&format!("sys/block/{}/device/state", dev))
    }

    /// `dm/uuid` attribute of a device-mapper device.
    pub fn dm_uuid(&self, dm: &str) -> Option<String> {
        self.read_attr(&format!("sys/block/{}/dm/uuid", dm))
    }

    pub fn holders(&self, dev: &str) -> Vec<String> {
        self.list_dir(&format!("sys/block/{}/holders", dev))
    }

    pub fn slaves(&self, dm: &str) -> Vec<String> {
        self.list_dir(&format!("sys/block/{}/slaves", dm))
    }

    /// iSCSI session id a SCSI disk hangs off, derived from its sysfs link.
    ///
    /// `/sys/block/sdb -> ../devices/platform/host3/session7/target3:0:0/3:0:0:1/block/sdb`
    /// yields "7".
    pub fn session_of(&self, dev: &str) -> Option<String> {
        let target = self.read_link(&format!("sys/block/{}", dev))?;
        target.components().find_map(|c| {
            let name = c.as_os_str().to_str()?;
            let id = name.strip_prefix("session")?;
            (!id.is_empty() && id.chars().all(|ch| ch.is_ascii_digit())).then(|| id.to_string())
        })
    }
}

/// Last path component as a string.
pub fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}
