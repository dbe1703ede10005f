//! Connector configuration.
//!
//! The defaults are the production constants; they were tuned against real
//! kernel timing and should only be changed after re-validation.

use std::path::PathBuf;
use std::time::Duration;

/// Names (or absolute paths) of the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub iscsiadm: String,
    pub multipath: String,
    pub multipathd: String,
    pub blockdev: String,
    /// Vendor multipath CLI for SCSI disks
    pub ultrapath: String,
    /// Vendor multipath CLI for NVMe disks
    pub ultrapath_nvme: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            iscsiadm: "iscsiadm".into(),
            multipath: "multipath".into(),
            multipathd: "multipathd".into(),
            blockdev: "blockdev".into(),
            ultrapath: "upadmin".into(),
            ultrapath_nvme: "upadmin_plus".into(),
        }
    }
}

/// Tunables of the attach/detach engine.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Root under which `sys/` and `dev/` are resolved ("/" on a real host)
    pub sysfs_root: PathBuf,
    pub tools: ToolPaths,
    /// Deadline for a single external command
    pub command_timeout: Duration,
    /// Iterations of the login loop
    pub login_attempts: u32,
    /// Pause between login iterations
    pub login_interval: Duration,
    /// Rescan ceiling of the device scanner
    pub scan_attempts: u32,
    /// Pause between scanner polls; rescan countdowns are counted in these ticks
    pub scan_interval: Duration,
    /// How long single-path mode waits for a device
    pub single_path_wait: Duration,
    /// Extra time granted to device-mapper once every task has finished
    pub multipath_grace: Duration,
    /// Poll interval of the reconciliation loops
    pub reconcile_interval: Duration,
    /// TCP reachability probe per portal, disabled when `None`
    pub portal_probe_timeout: Option<Duration>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/"),
            tools: ToolPaths::default(),
            command_timeout: Duration::from_secs(30),
            login_attempts: 60,
            login_interval: Duration::from_secs(2),
            scan_attempts: 3,
            scan_interval: Duration::from_secs(1),
            single_path_wait: Duration::from_secs(30),
            multipath_grace: Duration::from_secs(15),
            reconcile_interval: Duration::from_secs(1),
            portal_probe_timeout: Some(Duration::from_secs(3)),
        }
    }
}

impl ConnectorConfig {
    /// Configuration rooted at an alternative filesystem tree.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: root.into(),
            ..Self::default()
        }
    }
}
