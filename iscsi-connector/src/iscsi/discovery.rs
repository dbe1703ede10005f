//! Per-portal discovery tasks and the state they share.
//!
//! Every portal target gets its own tokio task that logs in, scans for the
//! LUN and publishes the block device it found. The coordinator watches the
//! shared [`DiscoveryState`] and, once it has a verdict, sets the stop latch
//! and joins every task.

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::scan::{DeviceScanner, ScanCursor};
use super::session;
use crate::config::ConnectorConfig;
use crate::descriptor::PortalTarget;
use crate::error::ConnectorError;
use crate::metrics;
use crate::platform::{DeviceOps, Sysfs};
use crate::transport::{Transport, portal_reachable};
use crate::types::{ChapCredentials, Wwn};

#[derive(Debug, Default)]
struct DeviceSets {
    /// Every device discovered so far, in discovery order
    found: Vec<String>,
    /// Devices not yet handed to the multipath layer
    pending: Vec<String>,
}

/// State shared between the discovery tasks and the coordinator.
#[derive(Debug, Default)]
pub struct DiscoveryState {
    logins: AtomicUsize,
    failed_logins: AtomicUsize,
    finished: AtomicUsize,
    devices: Mutex<DeviceSets>,
    stop: CancellationToken,
}

impl DiscoveryState {
    pub fn new() -> Self {
        Self::default()
    }

    fn sets(&self) -> MutexGuard<'_, DeviceSets> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_login(&self) {
        self.logins.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failed_login(&self) {
        self.failed_logins.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn failed_logins(&self) -> usize {
        self.failed_logins.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// True once each of `tasks` has reported its login outcome and every
    /// task that got past the login step has finished.
    pub fn logins_settled(&self, tasks: usize) -> bool {
        let reported = self.logins() + self.failed_logins();
        reported >= tasks && self.finished() == reported
    }

    /// Publish a discovered device. Duplicates are ignored.
    pub fn add_device(&self, dev: &str) {
        let mut sets = self.sets();
        if sets.found.iter().any(|d| d == dev) {
            return;
        }
        sets.found.push(dev.to_string());
        sets.pending.push(dev.to_string());
    }

    pub fn found(&self) -> Vec<String> {
        self.sets().found.clone()
    }

    /// Drain the devices not yet folded into a multipath map.
    pub fn take_pending(&self) -> Vec<String> {
        std::mem::take(&mut self.sets().pending)
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

/// Keeps the finished count honest even when a task unwinds.
struct FinishGuard<'a> {
    state: &'a DiscoveryState,
    portal: String,
    login_recorded: bool,
}

impl<'a> FinishGuard<'a> {
    fn new(state: &'a DiscoveryState, portal: String) -> Self {
        Self {
            state,
            portal,
            login_recorded: false,
        }
    }

    fn login_succeeded(&mut self) {
        self.state.record_login();
        self.login_recorded = true;
    }

    fn login_failed(&mut self) {
        self.state.record_failed_login();
        self.login_recorded = true;
    }
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if !self.login_recorded {
            self.state.record_failed_login();
        }
        if std::thread::panicking() {
            error!(
                portal = %self.portal,
                backtrace = %Backtrace::force_capture(),
                "Discovery task panicked"
            );
        }
        self.state.record_finished();
    }
}

/// What one portal contributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Logged in and found this block device
    Device(String),
    /// Logged in but the LUN never showed up
    NoDevice,
    /// No session could be established
    LoginFailed,
    /// The task panicked
    Aborted,
}

/// Everything a discovery task needs, shared across tasks.
pub struct TaskContext {
    pub transport: Transport,
    pub sysfs: Sysfs,
    pub devices: Arc<dyn DeviceOps>,
    pub config: Arc<ConnectorConfig>,
    pub wwn: Wwn,
    pub chap: Option<ChapCredentials>,
    pub state: Arc<DiscoveryState>,
}

async fn discover_portal(ctx: Arc<TaskContext>, target: PortalTarget) -> TaskOutcome {
    let mut guard = FinishGuard::new(&ctx.state, target.portal.to_string());

    let session = match session::connect_portal(
        &ctx.transport,
        &ctx.config,
        &target.portal,
        &target.iqn,
        ctx.chap.as_ref(),
    )
    .await
    {
        Ok(session) => {
            guard.login_succeeded();
            metrics::record_portal_login(true);
            session
        }
        Err(e) => {
            guard.login_failed();
            metrics::record_portal_login(false);
            warn!(portal = %target.portal, iqn = %target.iqn, error = %e, "Failed to establish session");
            return TaskOutcome::LoginFailed;
        }
    };

    let mut cursor = ScanCursor::for_mode(session.manual_scan);
    let scanner = DeviceScanner::new(
        &ctx.sysfs,
        ctx.devices.as_ref(),
        &ctx.config,
        ctx.state.stop_token(),
    );
    match scanner
        .scan(&session.id, &target.host_lun, &ctx.wwn, &mut cursor)
        .await
    {
        Some(dev) => {
            ctx.state.add_device(&dev);
            metrics::record_device_discovered();
            TaskOutcome::Device(dev)
        }
        None => {
            let err = ConnectorError::DeviceNotFound {
                wwn: ctx.wwn.to_string(),
            };
            debug!(portal = %target.portal, session = %session.id, error = %err, "Portal contributed no device");
            TaskOutcome::NoDevice
        }
    }
}

/// Drop portals that do not answer a TCP connect.
pub async fn reachable_targets(
    targets: Vec<PortalTarget>,
    probe_timeout: Option<std::time::Duration>,
) -> Vec<PortalTarget> {
    let Some(timeout) = probe_timeout else {
        return targets;
    };
    let probes = targets
        .iter()
        .map(|t| portal_reachable(&t.portal, timeout));
    let reachable = join_all(probes).await;
    targets
        .into_iter()
        .zip(reachable)
        .filter_map(|(target, ok)| ok.then_some(target))
        .collect()
}

/// Running set of discovery tasks.
pub struct Discovery {
    state: Arc<DiscoveryState>,
    tasks: Vec<JoinHandle<TaskOutcome>>,
}

impl Discovery {
    /// Spawn one task per portal target.
    pub fn spawn(ctx: Arc<TaskContext>, targets: Vec<PortalTarget>) -> Self {
        info!(wwn = %ctx.wwn, portals = targets.len(), "Starting discovery");
        let tasks = targets
            .into_iter()
            .map(|target| tokio::spawn(discover_portal(ctx.clone(), target)))
            .collect();
        Self {
            state: ctx.state.clone(),
            tasks,
        }
    }

    pub fn state(&self) -> &Arc<DiscoveryState> {
        &self.state
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn all_finished(&self) -> bool {
        self.state.finished() >= self.tasks.len()
    }

    /// Single-path mode: wait until some device exists or every task is done.
    pub async fn wait_single_device(&self, config: &ConnectorConfig) -> Option<String> {
        let deadline = Instant::now() + config.single_path_wait;
        loop {
            if let Some(dev) = self.state.found().into_iter().next() {
                return Some(dev);
            }
            if self.all_finished() {
                return None;
            }
            if Instant::now() >= deadline {
                warn!(wait = ?config.single_path_wait, "Timed out waiting for a device");
                return None;
            }
            tokio::time::sleep(config.reconcile_interval).await;
        }
    }

    /// Set the stop latch and wait for every task.
    pub async fn finish(self) -> Vec<TaskOutcome> {
        self.state.stop();
        join_all(self.tasks)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => {
                    error!(error = %e, "Discovery task panicked");
                    TaskOutcome::Aborted
                }
                Err(e) => {
                    warn!(error = %e, "Discovery task was cancelled");
                    TaskOutcome::Aborted
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ToolPaths;
    use crate::error::ExecError;
    use crate::testing::{FakeDevices, FakeRunner};
    use crate::types::Endpoint;

    fn target(host: &str) -> PortalTarget {
        PortalTarget {
            portal: Endpoint::new(host, 3260),
            iqn: "iqn.2006-08.com.example:t".into(),
            host_lun: "1".into(),
        }
    }

    fn context(runner: FakeRunner, devices: Arc<dyn DeviceOps>, root: &std::path::Path) -> Arc<TaskContext> {
        let config = Arc::new(ConnectorConfig::with_root(root));
        Arc::new(TaskContext {
            transport: Transport::new(Arc::new(runner), ToolPaths::default(), Duration::from_secs(1)),
            sysfs: Sysfs::new(root),
            devices,
            config,
            wwn: Wwn::parse("600abc").unwrap(),
            chap: None,
            state: Arc::new(DiscoveryState::new()),
        })
    }

    #[test]
    fn test_add_device_deduplicates() {
        let state = DiscoveryState::new();
        state.add_device("sdb");
        state.add_device("sdc");
        state.add_device("sdb");
        assert_eq!(state.found(), vec!["sdb", "sdc"]);
        assert_eq!(state.take_pending(), vec!["sdb", "sdc"]);
        assert!(state.take_pending().is_empty());
        assert_eq!(state.found().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_finish_counts_are_exact() {
        let state = Arc::new(DiscoveryState::new());
        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let state = state.clone();
                tokio::spawn(async move {
                    let mut guard = FinishGuard::new(&state, format!("10.0.0.{}", i));
                    if i % 2 == 0 {
                        guard.login_succeeded();
                        state.add_device(&format!("sd{}", i));
                    }
                    tokio::task::yield_now().await;
                })
            })
            .collect();
        for task in join_all(tasks).await {
            task.unwrap();
        }
        assert_eq!(state.finished(), 64);
        assert_eq!(state.logins(), 32);
        assert_eq!(state.failed_logins(), 32);
        assert_eq!(state.found().len(), 32);
        assert!(state.logins_settled(64));
        assert!(!state.logins_settled(65));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_still_finishes() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(
            tmp.path()
                .join("sys/class/scsi_host/host2/device/session4/target2:0:0/2:0:0:1/block/sdb"),
        )
        .unwrap();
        std::fs::create_dir_all(tmp.path().join("sys/class/iscsi_host/host2/device/session4/target2:0:0"))
            .unwrap();
        let runner = FakeRunner::new(|_, args| {
            if args.iter().any(|a| a == "session") {
                return Ok(crate::exec::CommandOutput::success(
                    "tcp: [4] 10.0.0.1:3260,1 iqn.2006-08.com.example:t (non-flash)\n",
                ));
            }
            Ok(crate::exec::CommandOutput::success(""))
        });
        let devices = FakeDevices {
            panic_on_probe: true,
            ..FakeDevices::default()
        };
        let ctx = context(runner, Arc::new(devices), tmp.path());
        let discovery = Discovery::spawn(ctx.clone(), vec![target("10.0.0.1")]);
        while !discovery.all_finished() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let outcomes = discovery.finish().await;
        assert_eq!(outcomes, vec![TaskOutcome::Aborted]);
        assert_eq!(ctx.state.finished(), 1);
        assert_eq!(ctx.state.logins(), 1);
        assert!(ctx.state.found().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_failed_login() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = FakeRunner::new(|program, _| Err(ExecError::Timeout(program.to_string())));
        let ctx = context(runner, Arc::new(FakeDevices::default()), tmp.path());
        let discovery = Discovery::spawn(ctx.clone(), vec![target("10.0.0.1")]);

        assert_eq!(discovery.wait_single_device(&ctx.config).await, None);
        assert_eq!(discovery.finish().await, vec![TaskOutcome::LoginFailed]);
        assert_eq!(ctx.state.failed_logins(), 1);
        assert_eq!(ctx.state.logins(), 0);
        assert_eq!(ctx.state.finished(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_disabled_keeps_all_targets() {
        let targets = vec![target("10.0.0.1"), target("10.0.0.2")];
        assert_eq!(reachable_targets(targets.clone(), None).await, targets);
    }
}
