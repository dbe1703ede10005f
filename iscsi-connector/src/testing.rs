//! Test doubles shared by the unit tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::exec::{CommandOutput, CommandRunner};
use crate::platform::{DeviceOps, VirtualDevice};
use crate::types::{MultipathPolicy, Wwn};

type Handler = dyn Fn(&str, &[String]) -> Result<CommandOutput, ExecError> + Send + Sync;

/// Command runner answering from a closure and recording every call.
pub struct FakeRunner {
    handler: Box<Handler>,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new(
        handler: impl Fn(&str, &[String]) -> Result<CommandOutput, ExecError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Runner for which every command succeeds with empty output.
    pub fn ok() -> Self {
        Self::new(|_, _| Ok(CommandOutput::success("")))
    }

    /// Recorded calls as "program arg arg ...".
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", program, args.join(" ")));
        (self.handler)(program, args)
    }
}

/// True when `args` contains `flag` immediately followed by `value`.
pub fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
    args.windows(2).any(|w| w[0] == flag && w[1] == value)
}

/// Scriptable device helpers recording what the engine asked for.
#[derive(Default)]
pub struct FakeDevices {
    /// A map named "dm-0" appears once this many paths were added
    pub multipath_after_paths: Option<usize>,
    /// Disk the vendor tool reports, if any
    pub vendor_disk: Option<String>,
    /// Panic on the first device probe
    pub panic_on_probe: bool,
    /// `device/wwid` of individual disks (normalized)
    pub device_wwids: Vec<(String, String)>,
    /// WWID of the "dm-0" map
    pub map_wwid: Option<String>,
    pub wwids_added: Mutex<Vec<String>>,
    pub paths_added: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

impl FakeDevices {
    pub fn paths(&self) -> Vec<String> {
        self.paths_added.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceOps for FakeDevices {
    async fn clear_unavailable_device(&self, _dev: &str, _wwn: &Wwn) -> bool {
        if self.panic_on_probe {
            panic!("device probe failed");
        }
        true
    }

    async fn remove_devices(&self, devices: &[String]) -> crate::error::Result<()> {
        self.removed.lock().unwrap().extend_from_slice(devices);
        Ok(())
    }

    async fn find_available_multipath(&self, _devices: &[String]) -> Option<String> {
        let needed = self.multipath_after_paths?;
        (self.paths_added.lock().unwrap().len() >= needed).then(|| "dm-0".to_string())
    }

    async fn multipath_add_wwid(&self, wwid: &str) -> bool {
        self.wwids_added.lock().unwrap().push(wwid.to_string());
        true
    }

    async fn multipath_add_path(&self, dev: &str) -> bool {
        self.paths_added.lock().unwrap().push(dev.to_string());
        true
    }

    async fn flush_dm_device(&self, _dm: &str) -> crate::error::Result<()> {
        Ok(())
    }

    async fn get_virtual_device(&self, _wwn: &Wwn) -> Option<VirtualDevice> {
        None
    }

    async fn get_physical_devices(&self, _virtual: &VirtualDevice, _wwn: &Wwn) -> Vec<String> {
        Vec::new()
    }

    async fn disk_name_by_wwn(&self, _policy: MultipathPolicy, _wwn: &Wwn) -> Option<String> {
        self.vendor_disk.clone()
    }

    async fn verify_dm_device(&self, _dm: &str, _wwn: &Wwn, _paths: usize) -> crate::error::Result<()> {
        Ok(())
    }

    async fn verify_vendor_device(
        &self,
        _policy: MultipathPolicy,
        _disk: &str,
        _wwn: &Wwn,
    ) -> crate::error::Result<()> {
        Ok(())
    }

    async fn verify_single_device(&self, _dev: &str, _wwn: &Wwn) -> crate::error::Result<()> {
        Ok(())
    }

    fn device_wwid(&self, dev: &str) -> Option<String> {
        self.device_wwids
            .iter()
            .find(|(name, _)| name == dev)
            .map(|(_, wwid)| wwid.clone())
    }

    fn dm_wwid(&self, _dm: &str) -> Option<String> {
        self.map_wwid.clone()
    }
}
