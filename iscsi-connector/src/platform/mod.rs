//! Host device operations for the connectors
//!
//! Provides the Linux implementation of the device helpers the attach and
//! detach engines rely on: clearing stale SCSI devices, device-mapper map
//! discovery and registration, vendor multipath queries, device removal and
//! post-attach verification.
//!
//! # Usage
//!
//! ```ignore
//! use crate::platform::{DeviceOps, HostDevices, Sysfs};
//!
//! let devices = HostDevices::new(Sysfs::new("/"), transport);
//! if let Some(dm) = devices.find_available_multipath(&found).await {
//!     devices.verify_dm_device(&dm, &wwn, 2).await?;
//! }
//! ```

mod linux;
mod sysfs;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{MultipathPolicy, Wwn};

pub use linux::HostDevices;
pub use sysfs::{Sysfs, file_name};

/// Device presenting a LUN to users, with the policy that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDevice {
    /// Kernel name, e.g. "dm-3" or "sdb"
    pub name: String,
    pub policy: MultipathPolicy,
}

/// Device helpers used by the connect and teardown engines.
#[async_trait]
pub trait DeviceOps: Send + Sync {
    /// Decide whether `dev` is a usable path to `wwn`.
    ///
    /// Stale devices (wrong WWN, offline) are deleted and rejected.
    async fn clear_unavailable_device(&self, dev: &str, wwn: &Wwn) -> bool;

    /// Remove devices in the given order. Already-absent devices are skipped.
    async fn remove_devices(&self, devices: &[String]) -> Result<()>;

    /// Device-mapper map currently holding any of `devices`.
    async fn find_available_multipath(&self, devices: &[String]) -> Option<String>;

    /// Register a WWID with multipath; returns whether it succeeded.
    async fn multipath_add_wwid(&self, wwid: &str) -> bool;

    /// Hand a discovered device to multipathd as a path.
    async fn multipath_add_path(&self, dev: &str) -> bool;

    /// Flush a device-mapper map; no-op if the map is already gone.
    async fn flush_dm_device(&self, dm: &str) -> Result<()>;

    /// Resolve a WWN to the device users see and the policy behind it.
    async fn get_virtual_device(&self, wwn: &Wwn) -> Option<VirtualDevice>;

    /// Physical SCSI devices backing a virtual device.
    async fn get_physical_devices(&self, virtual_device: &VirtualDevice, wwn: &Wwn) -> Vec<String>;

    /// Vendor multipath disk name for a WWN.
    async fn disk_name_by_wwn(&self, policy: MultipathPolicy, wwn: &Wwn) -> Option<String>;

    async fn verify_dm_device(&self, dm: &str, wwn: &Wwn, expected_paths: usize) -> Result<()>;

    async fn verify_vendor_device(&self, policy: MultipathPolicy, disk: &str, wwn: &Wwn)
    -> Result<()>;

    async fn verify_single_device(&self, dev: &str, wwn: &Wwn) -> Result<()>;

    /// Multipath-style WWID of a SCSI disk (`device/wwid`, normalized).
    fn device_wwid(&self, dev: &str) -> Option<String>;

    /// WWID of a device-mapper map (`dm/uuid` without the `mpath-` prefix).
    fn dm_wwid(&self, dm: &str) -> Option<String>;
}
