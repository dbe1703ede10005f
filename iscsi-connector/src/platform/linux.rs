//! Linux implementation of the device helpers
//!
//! Uses Linux-specific interfaces:
//! - sysfs (`/sys/block`, `holders`, `slaves`, `device/delete`) for SCSI devices
//! - multipath / multipathd for device-mapper multipath
//! - blockdev for buffer flushing
//! - the vendor multipath CLI for vendor-managed disks

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::sysfs::Sysfs;
use super::{DeviceOps, VirtualDevice};
use crate::error::{ConnectorError, Result};
use crate::transport::{Tool, Transport};
use crate::types::{MultipathPolicy, Wwn, normalize_wwid};

/// Device helpers operating on the local host.
#[derive(Clone)]
pub struct HostDevices {
    sysfs: Sysfs,
    transport: Transport,
}

impl HostDevices {
    pub fn new(sysfs: Sysfs, transport: Transport) -> Self {
        Self { sysfs, transport }
    }

    /// Ask the SCSI midlayer to drop a device. Absent devices are ignored.
    fn delete_scsi_device(&self, dev: &str) -> Result<()> {
        let rel = format!("sys/block/{}/device/delete", dev);
        if !self.sysfs.exists(&rel) {
            debug!(device = %dev, "Device already removed");
            return Ok(());
        }
        self.sysfs.write_attr(&rel, "1")?;
        info!(device = %dev, "Removed SCSI device");
        Ok(())
    }

    async fn flush_buffers(&self, dev: &str) {
        let path = format!("/dev/{}", dev);
        if let Err(e) = self
            .transport
            .run_filter_log(Tool::Blockdev, &["--flushbufs", &path], &[])
            .await
        {
            debug!(device = %dev, error = %e, "Failed to flush device buffers");
        }
    }

    /// Run the vendor CLI and return the `show vlun` rows.
    async fn vendor_vluns(&self, policy: MultipathPolicy) -> Option<Vec<VlunRow>> {
        let tool = match policy {
            MultipathPolicy::UltraPath => Tool::UltraPath,
            MultipathPolicy::UltraPathNvme => Tool::UltraPathNvme,
            _ => return None,
        };
        let output = self
            .transport
            .run_filter_log(tool, &["show", "vlun"], &[])
            .await
            .ok()?;
        Some(parse_vlun_table(&output.stdout))
    }

    fn is_dm(name: &str) -> bool {
        name.starts_with("dm-")
    }
}

/// One row of the vendor CLI's `show vlun` table.
#[derive(Debug, Clone, PartialEq, Eq)]
struct VlunRow {
    disk: String,
    wwn: String,
    status: String,
}

/// Parse `show vlun` output.
///
/// Rows look like:
/// `0   sdb   lun01   6a8ffba1005d5a2a02ec9a4300000061   Normal   10.00GB ...`
/// (vlun id, disk, name, LUN WWN, status, ...). Header and separator lines
/// are skipped because their first column is not numeric.
fn parse_vlun_table(output: &str) -> Vec<VlunRow> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 || fields[0].parse::<u32>().is_err() {
                return None;
            }
            Some(VlunRow {
                disk: fields[1].to_string(),
                wwn: fields[3].to_lowercase(),
                status: fields[4].to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl DeviceOps for HostDevices {
    async fn clear_unavailable_device(&self, dev: &str, wwn: &Wwn) -> bool {
        let Some(raw) = self.sysfs.device_wwid(dev) else {
            debug!(device = %dev, "Device WWID not readable yet");
            return false;
        };

        if !wwn.matches(&raw) {
            warn!(
                device = %dev,
                found = %raw,
                expected = %wwn,
                "Device reports a different LUN, removing stale device"
            );
            if let Err(e) = self.delete_scsi_device(dev) {
                warn!(device = %dev, error = %e, "Failed to remove stale device");
            }
            return false;
        }

        match self.sysfs.device_state(dev).as_deref() {
            None | Some("running") => true,
            Some(state @ ("offline" | "transport-offline")) => {
                warn!(device = %dev, state, "Device is unavailable, removing it");
                if let Err(e) = self.delete_scsi_device(dev) {
                    warn!(device = %dev, error = %e, "Failed to remove unavailable device");
                }
                false
            }
            Some(state) => {
                debug!(device = %dev, state, "Device not ready yet");
                false
            }
        }
    }

    async fn remove_devices(&self, devices: &[String]) -> Result<()> {
        let mut first_error = None;
        for dev in devices {
            if !self.sysfs.block_exists(dev) {
                debug!(device = %dev, "Device already absent");
                continue;
            }
            self.flush_buffers(dev).await;
            // dm maps are torn down by flush_dm_device once their paths are gone
            if Self::is_dm(dev) {
                continue;
            }
            if let Err(e) = self.delete_scsi_device(dev) {
                warn!(device = %dev, error = %e, "Failed to remove device");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn find_available_multipath(&self, devices: &[String]) -> Option<String> {
        // Check /sys/block/<device>/holders/ for dm-* entries
        for dev in devices {
            if let Some(holder) = self.sysfs.holders(dev).into_iter().find(|h| Self::is_dm(h)) {
                info!(device = %dev, multipath = %holder, "Device is multipathed");
                return Some(holder);
            }
        }
        None
    }

    async fn multipath_add_wwid(&self, wwid: &str) -> bool {
        match self.transport.run(Tool::Multipath, &["-a", wwid], &[]).await {
            Ok(_) => {
                info!(wwid = %wwid, "Registered WWID with multipath");
                true
            }
            Err(e) => {
                warn!(wwid = %wwid, error = %e, "Failed to register WWID with multipath");
                false
            }
        }
    }

    async fn multipath_add_path(&self, dev: &str) -> bool {
        let path = format!("/dev/{}", dev);
        match self
            .transport
            .run(Tool::Multipathd, &["add", "path", &path], &[])
            .await
        {
            Ok(_) => {
                debug!(device = %dev, "Added path to multipathd");
                true
            }
            Err(e) => {
                warn!(device = %dev, error = %e, "Failed to add path to multipathd");
                false
            }
        }
    }

    async fn flush_dm_device(&self, dm: &str) -> Result<()> {
        if !self.sysfs.block_exists(dm) {
            debug!(multipath = %dm, "Multipath map already gone");
            return Ok(());
        }
        self.transport.run(Tool::Multipath, &["-f", dm], &[]).await?;
        info!(multipath = %dm, "Flushed multipath map");
        Ok(())
    }

    async fn get_virtual_device(&self, wwn: &Wwn) -> Option<VirtualDevice> {
        let block_devices = self.sysfs.block_devices();

        if let Some(dm) = block_devices
            .iter()
            .filter(|d| Self::is_dm(d))
            .find(|d| self.sysfs.dm_uuid(d).is_some_and(|u| wwn.matches(&u)))
        {
            return Some(VirtualDevice {
                name: dm.clone(),
                policy: MultipathPolicy::DeviceMapper,
            });
        }

        for policy in [MultipathPolicy::UltraPath, MultipathPolicy::UltraPathNvme] {
            if let Some(disk) = self.disk_name_by_wwn(policy, wwn).await {
                return Some(VirtualDevice { name: disk, policy });
            }
        }

        block_devices
            .into_iter()
            .filter(|d| !Self::is_dm(d))
            .find(|d| self.sysfs.device_wwid(d).is_some_and(|w| wwn.matches(&w)))
            .map(|name| VirtualDevice {
                name,
                policy: MultipathPolicy::None,
            })
    }

    async fn get_physical_devices(&self, virtual_device: &VirtualDevice, wwn: &Wwn) -> Vec<String> {
        match virtual_device.policy {
            MultipathPolicy::DeviceMapper => self.sysfs.slaves(&virtual_device.name),
            policy => self
                .sysfs
                .block_devices()
                .into_iter()
                .filter(|d| !Self::is_dm(d))
                .filter(|d| !(policy.is_vendor() && *d == virtual_device.name))
                .filter(|d| self.sysfs.device_wwid(d).is_some_and(|w| wwn.matches(&w)))
                .collect(),
        }
    }

    async fn disk_name_by_wwn(&self, policy: MultipathPolicy, wwn: &Wwn) -> Option<String> {
        self.vendor_vluns(policy)
            .await?
            .into_iter()
            .find(|row| wwn.matches(&row.wwn))
            .map(|row| row.disk)
    }

    async fn verify_dm_device(&self, dm: &str, wwn: &Wwn, expected_paths: usize) -> Result<()> {
        let uuid = self
            .sysfs
            .dm_uuid(dm)
            .ok_or_else(|| ConnectorError::verification(dm, "dm/uuid is not readable"))?;
        if !wwn.matches(&uuid) {
            return Err(ConnectorError::verification(
                dm,
                format!("map uuid {} does not belong to LUN {}", uuid, wwn),
            ));
        }

        let slaves = self.sysfs.slaves(dm);
        if slaves.len() != expected_paths {
            return Err(ConnectorError::verification(
                dm,
                format!(
                    "map has {} paths, expected {}",
                    slaves.len(),
                    expected_paths
                ),
            ));
        }

        for slave in &slaves {
            let consistent = self
                .sysfs
                .device_wwid(slave)
                .is_some_and(|w| wwn.matches(&w));
            if !consistent {
                return Err(ConnectorError::verification(
                    dm,
                    format!("path {} does not report LUN {}", slave, wwn),
                ));
            }
        }

        info!(multipath = %dm, paths = slaves.len(), "Multipath device verified");
        Ok(())
    }

    async fn verify_vendor_device(
        &self,
        policy: MultipathPolicy,
        disk: &str,
        wwn: &Wwn,
    ) -> Result<()> {
        let rows = self
            .vendor_vluns(policy)
            .await
            .ok_or_else(|| ConnectorError::verification(disk, "vendor multipath tool unavailable"))?;
        let row = rows
            .into_iter()
            .find(|row| wwn.matches(&row.wwn))
            .ok_or_else(|| ConnectorError::verification(disk, "LUN not listed by vendor tool"))?;

        if row.disk != disk {
            return Err(ConnectorError::verification(
                disk,
                format!("vendor tool maps LUN {} to {}", wwn, row.disk),
            ));
        }
        if !row.status.eq_ignore_ascii_case("normal") {
            return Err(ConnectorError::verification(
                disk,
                format!("vendor status is {}", row.status),
            ));
        }
        Ok(())
    }

    async fn verify_single_device(&self, dev: &str, wwn: &Wwn) -> Result<()> {
        let raw = self
            .sysfs
            .device_wwid(dev)
            .ok_or_else(|| ConnectorError::verification(dev, "device/wwid is not readable"))?;
        if !wwn.matches(&raw) {
            return Err(ConnectorError::verification(
                dev,
                format!("device reports {} instead of {}", raw, wwn),
            ));
        }
        if let Some(state) = self.sysfs.device_state(dev)
            && state != "running"
        {
            return Err(ConnectorError::verification(
                dev,
                format!("device state is {}", state),
            ));
        }
        Ok(())
    }

    fn device_wwid(&self, dev: &str) -> Option<String> {
        self.sysfs.device_wwid(dev).map(|w| normalize_wwid(&w))
    }

    fn dm_wwid(&self, dm: &str) -> Option<String> {
        self.sysfs.dm_uuid(dm).map(|uuid| {
            uuid.strip_prefix("mpath-")
                .unwrap_or(&uuid)
                .to_lowercase()
        })
    }
}
