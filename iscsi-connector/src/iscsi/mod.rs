//! iSCSI transport driver
//!
//! Attach fans out one discovery task per portal, reconciles the discovered
//! paths into a single device and verifies it. Detach resolves the LUN back
//! to its devices and sessions and removes them.
//!
//! # Usage
//!
//! ```ignore
//! let connector = IscsiConnector::new(ConnectorConfig::default(), Arc::new(SystemRunner));
//! let device = connector.connect_volume(&properties).await?;
//! connector.disconnect_volume("6a8ffba1005d5a2a02ec9a4300000061").await?;
//! ```

pub mod discovery;
pub mod reconcile;
pub mod scan;
pub mod session;
pub mod teardown;

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::ConnectorConfig;
use crate::descriptor::{ConnectionDescriptor, Properties};
use crate::error::{ConnectorError, Result};
use crate::exec::CommandRunner;
use crate::metrics::OperationTimer;
use crate::platform::{DeviceOps, HostDevices, Sysfs};
use crate::transport::Transport;
use crate::types::{MultipathPolicy, Wwn};

use discovery::{Discovery, DiscoveryState, TaskContext, reachable_targets};
use reconcile::Reconciler;
use teardown::Teardown;

/// Attaches and detaches iSCSI volumes on the local host.
#[derive(Clone)]
pub struct IscsiConnector {
    config: Arc<ConnectorConfig>,
    transport: Transport,
    sysfs: Sysfs,
    devices: Arc<dyn DeviceOps>,
}

impl IscsiConnector {
    pub fn new(config: ConnectorConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let transport = Transport::new(runner, config.tools.clone(), config.command_timeout);
        let sysfs = Sysfs::new(&config.sysfs_root);
        let devices = Arc::new(HostDevices::new(sysfs.clone(), transport.clone()));
        Self {
            config: Arc::new(config),
            transport,
            sysfs,
            devices,
        }
    }

    /// Use custom device helpers instead of the host's.
    pub fn with_devices(mut self, devices: Arc<dyn DeviceOps>) -> Self {
        self.devices = devices;
        self
    }

    /// Attach the volume described by `properties` and return its device path.
    #[instrument(skip(self, properties))]
    pub async fn connect_volume(&self, properties: &Properties) -> Result<String> {
        let timer = OperationTimer::new("connect_volume");
        match self.connect(properties).await {
            Ok(path) => {
                timer.success();
                Ok(path)
            }
            Err(e) => {
                timer.failure(e.code());
                Err(e)
            }
        }
    }

    /// Detach the volume with the given WWN. Succeeds if it is already gone.
    #[instrument(skip(self))]
    pub async fn disconnect_volume(&self, wwn: &str) -> Result<()> {
        let timer = OperationTimer::new("disconnect_volume");
        let result = match Wwn::parse(wwn) {
            Ok(wwn) => {
                Teardown::new(&self.transport, &self.sysfs, self.devices.as_ref())
                    .run(&wwn)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        match &result {
            Ok(()) => timer.success(),
            Err(e) => timer.failure(e.code()),
        }
        result
    }

    async fn connect(&self, properties: &Properties) -> Result<String> {
        let descriptor = ConnectionDescriptor::from_properties(properties)?;
        let wwn = descriptor.wwn.clone();

        let targets = descriptor.targets();
        let candidates = targets.len();
        let targets = reachable_targets(targets, self.config.portal_probe_timeout).await;
        if targets.is_empty() {
            let portals: Vec<String> = descriptor.portals.iter().map(|p| p.to_string()).collect();
            return Err(ConnectorError::NoReachablePortal(portals.join(", ")));
        }
        if targets.len() < candidates {
            warn!(
                reachable = targets.len(),
                portals = candidates,
                "Skipping unreachable portals"
            );
        }

        let ctx = Arc::new(TaskContext {
            transport: self.transport.clone(),
            sysfs: self.sysfs.clone(),
            devices: self.devices.clone(),
            config: self.config.clone(),
            wwn: wwn.clone(),
            chap: descriptor.chap.clone(),
            state: Arc::new(DiscoveryState::new()),
        });
        let discovery = Discovery::spawn(ctx, targets);
        let state = discovery.state().clone();

        let handle = if descriptor.use_multipath {
            Reconciler::new(
                self.devices.as_ref(),
                &state,
                &self.config,
                &wwn,
                discovery.task_count(),
            )
            .run(descriptor.policy)
            .await
        } else {
            discovery.wait_single_device(&self.config).await
        };
        discovery.finish().await;

        info!(
            wwn = %wwn,
            logins = state.logins(),
            failed_logins = state.failed_logins(),
            devices = state.found().len(),
            "Discovery finished"
        );

        if !descriptor.use_multipath {
            let dev = handle.ok_or_else(|| {
                ConnectorError::volume_not_found(wwn.as_str(), "no device discovered")
            })?;
            self.devices.verify_single_device(&dev, &wwn).await?;
            info!(device = %dev, wwn = %wwn, "Volume connected");
            return Ok(format!("/dev/{}", dev));
        }

        let Some(handle) = handle else {
            let found = state.found();
            if !found.is_empty() {
                warn!(devices = ?found, "Removing paths without a multipath device");
                if let Err(e) = self.devices.remove_devices(&found).await {
                    warn!(error = %e, "Failed to remove orphaned paths");
                }
            }
            return Err(ConnectorError::volume_not_found(
                wwn.as_str(),
                format!("no {} device assembled", descriptor.policy),
            ));
        };

        match descriptor.policy {
            MultipathPolicy::DeviceMapper => {
                self.devices
                    .verify_dm_device(&handle, &wwn, state.logins())
                    .await?
            }
            policy => self.devices.verify_vendor_device(policy, &handle, &wwn).await?,
        }
        info!(device = %handle, wwn = %wwn, policy = %descriptor.policy, "Volume connected");
        Ok(format!("/dev/{}", handle))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::exec::CommandOutput;
    use crate::testing::{FakeDevices, FakeRunner};

    fn config(root: &std::path::Path) -> ConnectorConfig {
        ConnectorConfig {
            portal_probe_timeout: None,
            ..ConnectorConfig::with_root(root)
        }
    }

    fn properties(value: serde_json::Value) -> Properties {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("properties must be an object"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_length_mismatch_rejected_before_any_command() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::ok());
        let connector = IscsiConnector::new(config(tmp.path()), runner.clone());

        let err = connector
            .connect_volume(&properties(json!({
                "tgtLunWWN": "600abc",
                "tgtPortals": ["10.0.0.1", "10.0.0.2"],
                "tgtIQNs": ["iqn.a"],
                "tgtHostLUNs": ["1", "1"],
            })))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::Validation(crate::error::DescriptorError::LengthMismatch { .. })
        ));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_multipath_type_is_fatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::ok());
        let connector = IscsiConnector::new(config(tmp.path()), runner.clone());

        let err = connector
            .connect_volume(&properties(json!({
                "tgtLunWWN": "600abc",
                "tgtPortals": ["10.0.0.1"],
                "tgtIQNs": ["iqn.a"],
                "tgtHostLUNs": ["1"],
                "volumeUseMultiPath": true,
                "multiPathType": "EMC-PowerPath",
            })))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unsupported_multipath_type");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_multipath_without_handle_removes_paths() {
        let tmp = tempfile::TempDir::new().unwrap();
        for (host, sid, dev) in [("2", "4", "sdb"), ("3", "5", "sdc")] {
            std::fs::create_dir_all(tmp.path().join(format!(
                "sys/class/iscsi_host/host{host}/device/session{sid}/target{host}:0:0"
            )))
            .unwrap();
            std::fs::create_dir_all(tmp.path().join(format!(
                "sys/class/scsi_host/host{host}/device/session{sid}/target{host}:0:0/{host}:0:0:1/block/{dev}"
            )))
            .unwrap();
        }
        let runner = Arc::new(FakeRunner::new(|_, args| {
            if args.iter().any(|a| a == "session") {
                return Ok(CommandOutput::success(
                    "tcp: [4] 10.0.0.1:3260,1 iqn.a (non-flash)\n\
                     tcp: [5] 10.0.0.2:3260,1 iqn.a (non-flash)\n",
                ));
            }
            Ok(CommandOutput::success(""))
        }));
        let devices = Arc::new(FakeDevices::default());
        let connector =
            IscsiConnector::new(config(tmp.path()), runner).with_devices(devices.clone());

        let err = connector
            .connect_volume(&properties(json!({
                "tgtLunWWN": "600abc",
                "tgtPortals": ["10.0.0.1", "10.0.0.2"],
                "tgtIQNs": ["iqn.a", "iqn.a"],
                "tgtHostLUNs": ["1", "1"],
                "volumeUseMultiPath": "true",
            })))
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectorError::VolumeNotFound { .. }));
        let mut removed = devices.removed();
        removed.sort();
        assert_eq!(removed, vec!["sdb", "sdc"]);
        assert_eq!(devices.paths().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vendor_multipath_returns_vendor_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(
            tmp.path()
                .join("sys/class/iscsi_host/host2/device/session4/target2:0:0"),
        )
        .unwrap();
        std::fs::create_dir_all(
            tmp.path()
                .join("sys/class/scsi_host/host2/device/session4/target2:0:0/2:0:0:1/block/sdb"),
        )
        .unwrap();
        let runner = Arc::new(FakeRunner::new(|_, args| {
            if args.iter().any(|a| a == "session") {
                return Ok(CommandOutput::success(
                    "tcp: [4] 10.0.0.1:3260,1 iqn.a (non-flash)\n",
                ));
            }
            Ok(CommandOutput::success(""))
        }));
        let devices = Arc::new(FakeDevices {
            vendor_disk: Some("sdq".into()),
            ..FakeDevices::default()
        });
        let connector =
            IscsiConnector::new(config(tmp.path()), runner).with_devices(devices.clone());

        let path = connector
            .connect_volume(&properties(json!({
                "tgtLunWWN": "600abc",
                "tgtPortals": ["10.0.0.1"],
                "tgtIQNs": ["iqn.a"],
                "tgtHostLUNs": ["1"],
                "volumeUseMultiPath": true,
                "multiPathType": "HW-UltraPath",
            })))
            .await
            .unwrap();
        assert_eq!(path, "/dev/sdq");
        assert!(devices.paths().is_empty());
    }
}
