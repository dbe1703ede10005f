//! Transport command adapter.
//!
//! Wraps iscsiadm, the multipath tools and the vendor multipath CLI.
//! Command lines are masked before they are logged and exit codes are
//! classified against a per-call list of acceptable codes.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::config::ToolPaths;
use crate::error::{ConnectorError, ExecError, Result};
use crate::exec::{CommandOutput, CommandRunner};
use crate::types::Endpoint;

/// iscsiadm: session already exists
pub const ISCSI_ERR_SESS_EXISTS: i32 = 15;
/// iscsiadm: no records/objects found
pub const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;
/// iscsiadm: generic failure, also returned by old versions for "no records"
pub const ISCSI_ERR_GENERIC: i32 = 255;

const MASK: &str = "******";

/// External tools driven by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Iscsiadm,
    Multipath,
    Multipathd,
    Blockdev,
    UltraPath,
    UltraPathNvme,
}

impl Tool {
    fn program(self, tools: &ToolPaths) -> &str {
        match self {
            Tool::Iscsiadm => &tools.iscsiadm,
            Tool::Multipath => &tools.multipath,
            Tool::Multipathd => &tools.multipathd,
            Tool::Blockdev => &tools.blockdev,
            Tool::UltraPath => &tools.ultrapath,
            Tool::UltraPathNvme => &tools.ultrapath_nvme,
        }
    }
}

/// How failures of a command are reported in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogMode {
    Normal,
    /// Failures are expected on some paths and only logged at debug level
    Filtered,
}

/// Runs the session-management and multipath tools.
#[derive(Clone)]
pub struct Transport {
    runner: Arc<dyn CommandRunner>,
    tools: ToolPaths,
    timeout: Duration,
}

impl Transport {
    pub fn new(runner: Arc<dyn CommandRunner>, tools: ToolPaths, timeout: Duration) -> Self {
        Self {
            runner,
            tools,
            timeout,
        }
    }

    /// Run `tool` and fail unless it exits 0 or with one of `accepted`.
    pub async fn run(&self, tool: Tool, args: &[&str], accepted: &[i32]) -> Result<CommandOutput> {
        self.execute(tool, args, accepted, LogMode::Normal).await
    }

    /// Like [`Transport::run`] but failures are only logged at debug level.
    pub async fn run_filter_log(
        &self,
        tool: Tool,
        args: &[&str],
        accepted: &[i32],
    ) -> Result<CommandOutput> {
        self.execute(tool, args, accepted, LogMode::Filtered).await
    }

    pub async fn iscsiadm(&self, args: &[&str], accepted: &[i32]) -> Result<CommandOutput> {
        self.run(Tool::Iscsiadm, args, accepted).await
    }

    async fn execute(
        &self,
        tool: Tool,
        args: &[&str],
        accepted: &[i32],
        mode: LogMode,
    ) -> Result<CommandOutput> {
        let program = tool.program(&self.tools);
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let command = format!("{} {}", program, mask_args(&args));
        debug!(command = %command, "Running command");

        let output = match self.runner.run(program, &args, self.timeout).await {
            Ok(output) => output,
            Err(ExecError::Timeout(_)) => {
                warn!(command = %command, timeout = ?self.timeout, "Command timed out");
                return Err(ConnectorError::Timeout {
                    tool: program.to_string(),
                    command,
                });
            }
            Err(ExecError::Spawn { source, .. }) => {
                if mode == LogMode::Normal {
                    error!(command = %command, error = %source, "Failed to execute command");
                } else {
                    debug!(command = %command, error = %source, "Failed to execute command");
                }
                return Err(ConnectorError::ToolUnavailable {
                    tool: program.to_string(),
                    source,
                });
            }
        };

        if is_accepted(output.code, accepted) {
            return Ok(output);
        }

        let combined = output.combined();
        let combined = combined.trim();
        match mode {
            LogMode::Normal => {
                error!(command = %command, code = ?output.code, output = %combined, "Command failed")
            }
            LogMode::Filtered => {
                debug!(command = %command, code = ?output.code, output = %combined, "Command failed")
            }
        }
        Err(ConnectorError::ToolInvocation {
            tool: program.to_string(),
            command,
            code: output.code,
            output: combined.to_string(),
        })
    }
}

/// Exit code classification: 0 or any explicitly accepted code is success.
pub fn is_accepted(code: Option<i32>, accepted: &[i32]) -> bool {
    match code {
        Some(0) => true,
        Some(c) => accepted.contains(&c),
        None => false,
    }
}

/// Render a command line with secret values replaced.
///
/// iscsiadm takes secrets as `-n <name> -v <value>`; the value is masked
/// whenever the name refers to a password.
pub fn mask_args(args: &[String]) -> String {
    let mut masked = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for (i, arg) in args.iter().enumerate() {
        if mask_next {
            masked.push(MASK.to_string());
            mask_next = false;
            continue;
        }
        if (arg == "-v" || arg == "--value")
            && i > 0
            && args[i - 1].to_lowercase().contains("password")
        {
            mask_next = true;
        }
        masked.push(arg.clone());
    }
    masked.join(" ")
}

/// TCP reachability probe used to filter portals before any session work.
pub async fn portal_reachable(portal: &Endpoint, timeout: Duration) -> bool {
    let addr = (portal.host.as_str(), portal.port);
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            warn!(portal = %portal, error = %e, "Portal is not reachable");
            false
        }
        Err(_) => {
            warn!(portal = %portal, "Portal probe timed out");
            false
        }
    }
}
