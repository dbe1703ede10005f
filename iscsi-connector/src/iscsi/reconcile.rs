//! Multipath reconciliation.
//!
//! Runs next to the discovery tasks and decides when the aggregated device
//! for the LUN is stable. Device-mapper maps are assembled actively by
//! registering the WWID and handing every discovered path to multipathd;
//! vendor multipath builds its disk on its own and is only polled.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::discovery::DiscoveryState;
use crate::config::ConnectorConfig;
use crate::platform::DeviceOps;
use crate::types::{MultipathPolicy, Wwn};

/// Reconciles the discovered paths of one connect call into a multipath handle.
pub struct Reconciler<'a> {
    devices: &'a dyn DeviceOps,
    state: &'a DiscoveryState,
    config: &'a ConnectorConfig,
    wwn: &'a Wwn,
    tasks: usize,
}

/// Bookkeeping of one reconciliation run.
#[derive(Debug, Default)]
struct Progress {
    handle: Option<String>,
    grace_deadline: Option<Instant>,
}

impl Progress {
    /// Start the grace window once, then report whether it has run out.
    fn grace_expired(&mut self, grace: std::time::Duration) -> bool {
        let deadline = *self.grace_deadline.get_or_insert_with(|| {
            debug!(grace = ?grace, "All discovery tasks finished, waiting for multipath");
            Instant::now() + grace
        });
        Instant::now() >= deadline
    }
}

impl<'a> Reconciler<'a> {
    pub fn new(
        devices: &'a dyn DeviceOps,
        state: &'a DiscoveryState,
        config: &'a ConnectorConfig,
        wwn: &'a Wwn,
        tasks: usize,
    ) -> Self {
        Self {
            devices,
            state,
            config,
            wwn,
            tasks,
        }
    }

    fn all_finished(&self) -> bool {
        self.state.finished() >= self.tasks
    }

    /// Wait for a multipath handle under `policy`; `None` if there is none.
    pub async fn run(&self, policy: MultipathPolicy) -> Option<String> {
        match policy {
            MultipathPolicy::DeviceMapper => self.device_mapper().await,
            MultipathPolicy::UltraPath | MultipathPolicy::UltraPathNvme => self.vendor(policy).await,
            MultipathPolicy::None => None,
        }
    }

    /// WWID the multipath tools know this LUN by.
    fn resolve_wwid(&self, handle: Option<&str>, found: &[String]) -> String {
        handle
            .and_then(|dm| self.devices.dm_wwid(dm))
            .or_else(|| found.iter().find_map(|dev| self.devices.device_wwid(dev)))
            .unwrap_or_else(|| self.wwn.scsi_id())
    }

    fn settled(&self) -> bool {
        self.state.logins_settled(self.tasks)
    }

    async fn add_pending_paths(&self) {
        for dev in self.state.take_pending() {
            if !self.devices.multipath_add_path(&dev).await {
                warn!(device = %dev, "multipathd did not accept path");
            }
        }
    }

    /// Hand paths discovered after the map appeared to multipathd, skipping
    /// any that report a different WWID than the map.
    async fn fold_late_paths(&self, dm: &str) {
        let wwid = self.resolve_wwid(Some(dm), &self.state.found());
        for dev in self.state.take_pending() {
            if let Some(dev_wwid) = self.devices.device_wwid(&dev)
                && dev_wwid != wwid
            {
                warn!(
                    device = %dev,
                    multipath = %dm,
                    found = %dev_wwid,
                    expected = %wwid,
                    "Path reports a different WWID than the map, not adding it"
                );
                continue;
            }
            if !self.devices.multipath_add_path(&dev).await {
                warn!(device = %dev, multipath = %dm, "multipathd did not accept path");
            }
        }
    }

    async fn device_mapper(&self) -> Option<String> {
        let mut progress = Progress::default();
        let mut registered = false;

        loop {
            let found = self.state.found();
            let all_finished = self.all_finished();

            if all_finished && found.is_empty() {
                warn!(wwn = %self.wwn, "No path of the volume was discovered");
                return None;
            }

            if let Some(dm) = &progress.handle {
                self.fold_late_paths(dm).await;
            } else if !found.is_empty() {
                progress.handle = self.devices.find_available_multipath(&found).await;
                if progress.handle.is_none() {
                    if !registered {
                        let wwid = self.resolve_wwid(None, &found);
                        registered = self.devices.multipath_add_wwid(&wwid).await;
                    }
                    self.add_pending_paths().await;
                    progress.handle = self.devices.find_available_multipath(&found).await;
                }
                if let Some(dm) = &progress.handle {
                    info!(multipath = %dm, wwn = %self.wwn, "Multipath device assembled");
                    self.fold_late_paths(dm).await;
                }
            }

            if let Some(dm) = &progress.handle
                && self.settled()
            {
                // Tasks may have published a device since the last fold
                self.fold_late_paths(dm).await;
                debug!(multipath = %dm, "Multipath reconciliation complete");
                return progress.handle;
            }

            if all_finished
                && progress.handle.is_none()
                && progress.grace_expired(self.config.multipath_grace)
            {
                warn!(wwn = %self.wwn, "Multipath device did not appear");
                return None;
            }

            tokio::time::sleep(self.config.reconcile_interval).await;
        }
    }

    async fn vendor(&self, policy: MultipathPolicy) -> Option<String> {
        let mut progress = Progress::default();

        loop {
            let all_finished = self.all_finished();
            let found = self.state.found();
            if all_finished && found.is_empty() {
                warn!(wwn = %self.wwn, policy = %policy, "No path of the volume was discovered");
                return None;
            }

            if progress.handle.is_none() && !found.is_empty() {
                progress.handle = self.devices.disk_name_by_wwn(policy, self.wwn).await;
                if let Some(disk) = &progress.handle {
                    info!(disk = %disk, wwn = %self.wwn, policy = %policy, "Vendor multipath disk found");
                }
            }

            if progress.handle.is_some() && self.settled() {
                return progress.handle;
            }

            if all_finished
                && progress.handle.is_none()
                && progress.grace_expired(self.config.multipath_grace)
            {
                warn!(wwn = %self.wwn, policy = %policy, "Vendor multipath disk did not appear");
                return None;
            }

            tokio::time::sleep(self.config.reconcile_interval).await;
        }
    }
}
