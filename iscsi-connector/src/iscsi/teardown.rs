//! Volume teardown.
//!
//! Removes the host's view of a LUN and logs out of every session that no
//! longer backs any other device. Running it for a volume that is already
//! gone is a no-op.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::session::{self, node_args};
use crate::error::{ConnectorError, Result};
use crate::platform::{DeviceOps, Sysfs, file_name};
use crate::transport::{ISCSI_ERR_NO_OBJS_FOUND, Transport};
use crate::types::{MultipathPolicy, Wwn};

/// Tears down the devices and sessions of one LUN.
pub struct Teardown<'a> {
    transport: &'a Transport,
    sysfs: &'a Sysfs,
    devices: &'a dyn DeviceOps,
}

impl<'a> Teardown<'a> {
    pub fn new(transport: &'a Transport, sysfs: &'a Sysfs, devices: &'a dyn DeviceOps) -> Self {
        Self {
            transport,
            sysfs,
            devices,
        }
    }

    pub async fn run(&self, wwn: &Wwn) -> Result<()> {
        let Some(virtual_device) = self.devices.get_virtual_device(wwn).await else {
            info!(wwn = %wwn, "No device for volume, nothing to disconnect");
            return Ok(());
        };
        let physical = self.devices.get_physical_devices(&virtual_device, wwn).await;
        info!(
            wwn = %wwn,
            device = %virtual_device.name,
            policy = %virtual_device.policy,
            paths = physical.len(),
            "Disconnecting volume"
        );

        // Session links vanish with the devices, collect them first
        let session_ids: BTreeSet<String> = physical
            .iter()
            .filter_map(|dev| self.sysfs.session_of(dev))
            .collect();

        let mut removed = vec![virtual_device.name.clone()];
        removed.extend(physical.into_iter().filter(|d| *d != virtual_device.name));
        self.devices.remove_devices(&removed).await?;

        let mut errors = Vec::new();
        if !session_ids.is_empty()
            && let Err(e) = self.logout_unused(&session_ids, &removed).await
        {
            errors.push(e);
        }

        if virtual_device.policy == MultipathPolicy::DeviceMapper
            && let Err(e) = self.devices.flush_dm_device(&virtual_device.name).await
        {
            warn!(multipath = %virtual_device.name, error = %e, "Failed to flush multipath map");
            errors.push(e);
        }

        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Log out of every session in `session_ids` no other device depends on.
    async fn logout_unused(&self, session_ids: &BTreeSet<String>, removed: &[String]) -> Result<()> {
        let sessions = session::list_sessions(self.transport).await?;
        let mut first_error: Option<ConnectorError> = None;

        for entry in sessions.iter().filter(|s| session_ids.contains(&s.id)) {
            if self.session_in_use(&entry.portal, &entry.iqn, removed) {
                info!(portal = %entry.portal, iqn = %entry.iqn, "Session still in use, keeping it");
                continue;
            }

            let logout = node_args(&entry.iqn, &entry.portal, &["--logout"]);
            let delete = node_args(&entry.iqn, &entry.portal, &["--op", "delete"]);
            let result = match self.transport.iscsiadm(&logout, &[ISCSI_ERR_NO_OBJS_FOUND]).await {
                Ok(_) => self
                    .transport
                    .iscsiadm(&delete, &[ISCSI_ERR_NO_OBJS_FOUND])
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => info!(portal = %entry.portal, iqn = %entry.iqn, session = %entry.id, "Logged out of session"),
                Err(e) => {
                    warn!(portal = %entry.portal, iqn = %entry.iqn, error = %e, "Failed to log out of session");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether a device other than the removed ones still hangs off the session.
    fn session_in_use(&self, portal: &str, iqn: &str, removed: &[String]) -> bool {
        let pattern = format!(
            "dev/disk/by-path/ip-{}-iscsi-{}-lun-*",
            glob::Pattern::escape(portal),
            glob::Pattern::escape(iqn)
        );
        self.sysfs.glob(&pattern).iter().any(|link| {
            let Some(target) = std::fs::read_link(link).ok() else {
                return false;
            };
            match file_name(&target) {
                Some(dev) if !removed.contains(&dev) && self.sysfs.block_exists(&dev) => {
                    debug!(link = %link.display(), device = %dev, "Session backs another device");
                    true
                }
                _ => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::symlink;
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::config::ToolPaths;
    use crate::exec::CommandOutput;
    use crate::platform::HostDevices;
    use crate::testing::FakeRunner;

    const IQN: &str = "iqn.2006-08.com.example:t";

    fn teardown_parts(tmp: &TempDir, runner: Arc<FakeRunner>) -> (Transport, Sysfs, HostDevices) {
        let transport = Transport::new(runner, ToolPaths::default(), Duration::from_secs(1));
        let sysfs = Sysfs::new(tmp.path());
        let devices = HostDevices::new(sysfs.clone(), transport.clone());
        (transport, sysfs, devices)
    }

    /// Lays out sdX as a disk of session `sid` with a by-path link.
    fn iscsi_disk(tmp: &TempDir, dev: &str, wwid: &str, sid: &str, portal: &str, lun: u32) {
        let real = tmp.path().join(format!(
            "sys/devices/platform/host{sid}/session{sid}/target{sid}:0:0/{sid}:0:0:{lun}/block/{dev}"
        ));
        fs::create_dir_all(real.join("device")).unwrap();
        fs::write(real.join("device/wwid"), wwid).unwrap();
        fs::write(real.join("device/delete"), "").unwrap();
        fs::create_dir_all(tmp.path().join("sys/block")).unwrap();
        symlink(&real, tmp.path().join(format!("sys/block/{dev}"))).unwrap();

        let by_path = tmp.path().join("dev/disk/by-path");
        fs::create_dir_all(&by_path).unwrap();
        symlink(
            format!("../../{dev}"),
            by_path.join(format!("ip-{portal}-iscsi-{IQN}-lun-{lun}")),
        )
        .unwrap();
    }

    fn session_table(runner_out: &'static str) -> Arc<FakeRunner> {
        Arc::new(FakeRunner::new(move |_, args| {
            if args.iter().any(|a| a == "session") {
                return Ok(CommandOutput::success(runner_out));
            }
            Ok(CommandOutput::success(""))
        }))
    }

    #[tokio::test]
    async fn test_disconnect_without_device_is_noop() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(|program, _| {
            Err(crate::error::ExecError::Spawn {
                program: program.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        }));
        let (transport, sysfs, devices) = teardown_parts(&tmp, runner.clone());
        let wwn = Wwn::parse("600abc").unwrap();

        Teardown::new(&transport, &sysfs, &devices).run(&wwn).await.unwrap();
        // Only the vendor tools were probed, nothing was changed
        assert!(runner.calls().iter().all(|c| c.starts_with("upadmin")));
    }

    #[tokio::test]
    async fn test_disconnect_single_path_logs_out() {
        let tmp = TempDir::new().unwrap();
        iscsi_disk(&tmp, "sdb", "naa.600abc", "3", "10.0.0.1:3260", 1);
        let runner = session_table("tcp: [3] 10.0.0.1:3260,1 iqn.2006-08.com.example:t (non-flash)\n");
        let (transport, sysfs, devices) = teardown_parts(&tmp, runner.clone());
        let wwn = Wwn::parse("600abc").unwrap();

        Teardown::new(&transport, &sysfs, &devices).run(&wwn).await.unwrap();

        let deleted = fs::read_to_string(tmp.path().join("sys/block/sdb/device/delete")).unwrap();
        assert_eq!(deleted, "1");
        assert_eq!(runner.count("--logout"), 1);
        assert_eq!(runner.count("--op delete"), 1);
        assert_eq!(runner.count("multipath -f"), 0);
    }

    #[tokio::test]
    async fn test_shared_session_is_kept() {
        let tmp = TempDir::new().unwrap();
        iscsi_disk(&tmp, "sdb", "naa.600abc", "3", "10.0.0.1:3260", 1);
        iscsi_disk(&tmp, "sdc", "naa.600def", "3", "10.0.0.1:3260", 2);
        let runner = session_table("tcp: [3] 10.0.0.1:3260,1 iqn.2006-08.com.example:t (non-flash)\n");
        let (transport, sysfs, devices) = teardown_parts(&tmp, runner.clone());
        let wwn = Wwn::parse("600abc").unwrap();

        Teardown::new(&transport, &sysfs, &devices).run(&wwn).await.unwrap();

        assert_eq!(runner.count("--logout"), 0);
        let untouched = fs::read_to_string(tmp.path().join("sys/block/sdc/device/delete")).unwrap();
        assert_eq!(untouched, "");
    }

    #[tokio::test]
    async fn test_disconnect_multipath_flushes_map() {
        let tmp = TempDir::new().unwrap();
        iscsi_disk(&tmp, "sdb", "naa.600abc", "3", "10.0.0.1:3260", 1);
        iscsi_disk(&tmp, "sdc", "naa.600abc", "4", "10.0.0.2:3260", 1);
        let dm = tmp.path().join("sys/block/dm-1");
        fs::create_dir_all(dm.join("dm")).unwrap();
        fs::write(dm.join("dm/uuid"), "mpath-3600abc").unwrap();
        fs::create_dir_all(dm.join("slaves/sdb")).unwrap();
        fs::create_dir_all(dm.join("slaves/sdc")).unwrap();

        let runner = session_table(
            "tcp: [3] 10.0.0.1:3260,1 iqn.2006-08.com.example:t (non-flash)\n\
             tcp: [4] 10.0.0.2:3260,1 iqn.2006-08.com.example:t (non-flash)\n",
        );
        let (transport, sysfs, devices) = teardown_parts(&tmp, runner.clone());
        let wwn = Wwn::parse("600abc").unwrap();

        Teardown::new(&transport, &sysfs, &devices).run(&wwn).await.unwrap();

        assert_eq!(runner.count("--logout"), 2);
        assert_eq!(runner.count("multipath -f dm-1"), 1);
        let calls = runner.calls();
        let flush = calls.iter().position(|c| c == "blockdev --flushbufs /dev/dm-1").unwrap();
        let logout = calls.iter().position(|c| c.contains("--logout")).unwrap();
        assert!(flush < logout, "virtual device goes before the sessions");
    }
}
