//! SCSI bus rescans and block device lookup for one iSCSI session.

use std::fmt::{self, Display};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectorConfig;
use crate::platform::{DeviceOps, Sysfs, file_name};
use crate::types::Wwn;

/// Placeholder for a channel or target that could not be determined.
const WILDCARD: &str = "-";

/// SCSI address of a LUN behind an iSCSI session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hctl {
    pub host: String,
    pub channel: String,
    pub target: String,
    pub lun: String,
}

impl Hctl {
    /// Resolve the SCSI host (and, if present, channel and target) of a session.
    ///
    /// Looks for `sys/class/iscsi_host/host*/device/session<sid>/target<h>:<c>:<t>`
    /// and falls back to the bare session directory, leaving channel and
    /// target wildcarded.
    pub fn resolve(sysfs: &Sysfs, session_id: &str, lun: &str) -> Option<Self> {
        let base = format!("sys/class/iscsi_host/host*/device/session{}", session_id);

        if let Some(target) = sysfs.glob(&format!("{}/target*", base)).first() {
            let name = file_name(target)?;
            let mut parts = name.strip_prefix("target")?.split(':');
            if let (Some(host), Some(channel), Some(target)) = (parts.next(), parts.next(), parts.next()) {
                return Some(Self {
                    host: host.to_string(),
                    channel: channel.to_string(),
                    target: target.to_string(),
                    lun: lun.to_string(),
                });
            }
        }

        let session_dir = sysfs.glob(&base).into_iter().next()?;
        let host = session_dir
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .find_map(|c| c.strip_prefix("host"))?
            .to_string();
        Some(Self {
            host,
            channel: WILDCARD.to_string(),
            target: WILDCARD.to_string(),
            lun: lun.to_string(),
        })
    }

    /// Value written to the host's `scan` attribute.
    pub fn scan_request(&self) -> String {
        format!("{} {} {}", self.channel, self.target, self.lun)
    }

    /// Glob matching the block devices of this LUN.
    pub fn device_pattern(&self) -> String {
        let glob_part = |s: &str| if s == WILDCARD { "*".to_string() } else { s.to_string() };
        let (h, c, t) = (&self.host, glob_part(&self.channel), glob_part(&self.target));
        format!(
            "sys/class/scsi_host/host{h}/device/session*/target{h}:{c}:{t}/{h}:{c}:{t}:{lun}/block/*",
            lun = self.lun
        )
    }

    /// Ask the kernel to probe the LUN.
    pub fn rescan(&self, sysfs: &Sysfs) -> std::io::Result<()> {
        sysfs.write_attr(
            &format!("sys/class/scsi_host/host{}/scan", self.host),
            &self.scan_request(),
        )
    }

    /// First block device currently present for this LUN.
    pub fn find_device(&self, sysfs: &Sysfs) -> Option<String> {
        sysfs
            .glob(&self.device_pattern())
            .first()
            .and_then(|p| file_name(p))
    }
}

impl Display for Hctl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.host, self.channel, self.target, self.lun)
    }
}

/// Rescan bookkeeping of one discovery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor {
    /// Rescans issued so far
    pub rescans: u32,
    /// Scan intervals left before the next rescan is due
    pub countdown: u32,
}

impl ScanCursor {
    /// Manual scan mode: nothing has been scanned yet, rescan immediately.
    pub const fn manual() -> Self {
        Self {
            rescans: 0,
            countdown: 0,
        }
    }

    /// Automatic scan mode: the login already scanned once.
    pub const fn automatic() -> Self {
        Self {
            rescans: 1,
            countdown: Self::backoff(1),
        }
    }

    pub const fn for_mode(manual_scan: bool) -> Self {
        if manual_scan {
            Self::manual()
        } else {
            Self::automatic()
        }
    }

    /// Intervals to wait after the `n`th rescan.
    pub const fn backoff(n: u32) -> u32 {
        (n + 2) * (n + 2)
    }

    fn record_rescan(&mut self) {
        self.rescans += 1;
        self.countdown = Self::backoff(self.rescans);
    }

    fn tick(&mut self) {
        self.countdown = self.countdown.saturating_sub(1);
    }
}

/// Waits for the block device of one LUN on one session.
pub struct DeviceScanner<'a> {
    sysfs: &'a Sysfs,
    devices: &'a dyn DeviceOps,
    config: &'a ConnectorConfig,
    stop: &'a CancellationToken,
}

impl<'a> DeviceScanner<'a> {
    pub fn new(
        sysfs: &'a Sysfs,
        devices: &'a dyn DeviceOps,
        config: &'a ConnectorConfig,
        stop: &'a CancellationToken,
    ) -> Self {
        Self {
            sysfs,
            devices,
            config,
            stop,
        }
    }

    /// Rescan and poll until the LUN shows up, the attempts run out or the
    /// coordinator asks to stop.
    pub async fn scan(
        &self,
        session_id: &str,
        host_lun: &str,
        wwn: &Wwn,
        cursor: &mut ScanCursor,
    ) -> Option<String> {
        loop {
            if self.stop.is_cancelled() {
                debug!(session = %session_id, "Scan stopped");
                return None;
            }

            let hctl = Hctl::resolve(self.sysfs, session_id, host_lun);

            if cursor.countdown == 0 {
                cursor.record_rescan();
                if cursor.rescans > self.config.scan_attempts {
                    warn!(
                        session = %session_id,
                        lun = %host_lun,
                        wwn = %wwn,
                        rescans = self.config.scan_attempts,
                        "No device found after rescans"
                    );
                    return None;
                }
                match &hctl {
                    Some(hctl) => {
                        debug!(session = %session_id, hctl = %hctl, rescan = cursor.rescans, "Rescanning SCSI host");
                        if let Err(e) = hctl.rescan(self.sysfs) {
                            warn!(session = %session_id, hctl = %hctl, error = %e, "Failed to trigger rescan");
                        }
                    }
                    None => debug!(session = %session_id, "SCSI host of session not known yet"),
                }
            }

            if let Some(dev) = hctl.as_ref().and_then(|h| h.find_device(self.sysfs))
                && self.devices.clear_unavailable_device(&dev, wwn).await
            {
                info!(session = %session_id, device = %dev, wwn = %wwn, "Found device");
                return Some(dev);
            }

            tokio::select! {
                _ = self.stop.cancelled() => {
                    debug!(session = %session_id, "Scan stopped");
                    return None;
                }
                _ = tokio::time::sleep(self.config.scan_interval) => {}
            }
            cursor.tick();
        }
    }
}
