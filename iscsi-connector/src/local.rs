//! Local transport driver
//!
//! For LUNs that are already presented to the host (e.g. by a fabric or a
//! previous login): connect waits for the device and verifies it, disconnect
//! removes it.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::ConnectorConfig;
use crate::descriptor::{self, Properties};
use crate::error::{ConnectorError, Result};
use crate::exec::CommandRunner;
use crate::iscsi::teardown::Teardown;
use crate::metrics::OperationTimer;
use crate::platform::{DeviceOps, HostDevices, Sysfs, VirtualDevice};
use crate::transport::Transport;
use crate::types::{MultipathPolicy, Wwn};

#[derive(Clone)]
pub struct LocalConnector {
    config: Arc<ConnectorConfig>,
    transport: Transport,
    sysfs: Sysfs,
    devices: Arc<dyn DeviceOps>,
}

impl LocalConnector {
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

    #[instrument(skip(self, properties))]
    pub async fn connect_volume(&self, properties: &Properties) -> Result<String> {
        let timer = OperationTimer::new("local_connect_volume");
        let result = self.connect(properties).await;
        match &result {
            Ok(_) => timer.success(),
            Err(e) => timer.failure(e.code()),
        }
        result
    }

    #[instrument(skip(self))]
    pub async fn disconnect_volume(&self, wwn: &str) -> Result<()> {
        let timer = OperationTimer::new("local_disconnect_volume");
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
        let wwn = descriptor::lun_wwn(properties)?;
        let (_, requested) = descriptor::resolve_multipath(properties)?;

        let device = self.wait_for_device(&wwn).await?;
        if requested.is_multipath() && device.policy != requested {
            warn!(
                device = %device.name,
                requested = %requested,
                found = %device.policy,
                "Volume is managed by a different multipath layer"
            );
        }

        match device.policy {
            MultipathPolicy::DeviceMapper => {
                let paths = self.devices.get_physical_devices(&device, &wwn).await;
                self.devices
                    .verify_dm_device(&device.name, &wwn, paths.len())
                    .await?;
            }
            MultipathPolicy::None => self.devices.verify_single_device(&device.name, &wwn).await?,
            policy => {
                self.devices
                    .verify_vendor_device(policy, &device.name, &wwn)
                    .await?
            }
        }

        info!(device = %device.name, wwn = %wwn, policy = %device.policy, "Local volume connected");
        Ok(format!("/dev/{}", device.name))
    }

    async fn wait_for_device(&self, wwn: &Wwn) -> Result<VirtualDevice> {
        let deadline = Instant::now() + self.config.single_path_wait;
        loop {
            if let Some(device) = self.devices.get_virtual_device(wwn).await {
                return Ok(device);
            }
            if Instant::now() >= deadline {
                return Err(ConnectorError::DeviceNotFound {
                    wwn: wwn.to_string(),
                });
            }
            debug!(wwn = %wwn, "Waiting for local device");
            tokio::time::sleep(self.config.reconcile_interval).await;
        }
    }
}
