//! iSCSI node records and session login.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::ConnectorConfig;
use crate::error::{ConnectorError, Result};
use crate::transport::{
    ISCSI_ERR_GENERIC, ISCSI_ERR_NO_OBJS_FOUND, ISCSI_ERR_SESS_EXISTS, Tool, Transport,
};
use crate::types::{ChapCredentials, Endpoint};

/// `tcp: [7] 10.0.0.1:3260,1 iqn.2006-08.com.example:target0 (non-flash)`
static SESSION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\w+):\s+\[(\d+)\]\s+(\S+?),\S+\s+(\S+)").expect("session line regex is valid")
});

/// One row of `iscsiadm -m session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub transport: String,
    pub id: String,
    pub portal: String,
    pub iqn: String,
}

/// Parse the session table; unrecognized lines are skipped.
pub fn parse_sessions(output: &str) -> Vec<SessionEntry> {
    output
        .lines()
        .filter_map(|line| {
            let caps = SESSION_LINE.captures(line.trim())?;
            Some(SessionEntry {
                transport: caps[1].to_string(),
                id: caps[2].to_string(),
                portal: caps[3].to_string(),
                iqn: caps[4].to_string(),
            })
        })
        .collect()
}

/// Current sessions; "no active sessions" yields an empty list.
pub async fn list_sessions(transport: &Transport) -> Result<Vec<SessionEntry>> {
    let output = transport
        .iscsiadm(&["-m", "session"], &[ISCSI_ERR_NO_OBJS_FOUND, ISCSI_ERR_GENERIC])
        .await?;
    Ok(parse_sessions(&output.stdout))
}

/// `-m node -T <iqn> -p <portal>` followed by `extra`.
pub fn node_args<'a>(iqn: &'a str, portal: &'a str, extra: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec!["-m", "node", "-T", iqn, "-p", portal];
    args.extend_from_slice(extra);
    args
}

/// A logged-in session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    /// Whether `node.session.scan = manual` took effect
    pub manual_scan: bool,
}

/// Make sure a session to `iqn` through `portal` exists and return it.
pub async fn connect_portal(
    transport: &Transport,
    config: &ConnectorConfig,
    portal: &Endpoint,
    iqn: &str,
    chap: Option<&ChapCredentials>,
) -> Result<Session> {
    let portal_str = portal.to_portal_string();
    let portal_ref = portal_str.as_str();
    let node = |extra: &[&'static str]| node_args(iqn, portal_ref, extra);

    let probe = transport
        .iscsiadm(&node(&[]), &[ISCSI_ERR_NO_OBJS_FOUND, ISCSI_ERR_GENERIC])
        .await?;
    if probe.code != Some(0) {
        debug!(portal = %portal_str, iqn = %iqn, "Creating node record");
        transport
            .iscsiadm(&node(&["--interface", "default", "--op", "new"]), &[])
            .await?;
    }

    let manual_scan = transport
        .run_filter_log(
            Tool::Iscsiadm,
            &node(&["--op", "update", "-n", "node.session.scan", "-v", "manual"]),
            &[],
        )
        .await
        .is_ok();
    if !manual_scan {
        debug!(portal = %portal_str, "Manual scan not supported, kernel will scan on login");
    }

    if let Some(chap) = chap {
        let settings = [
            ("node.session.auth.authmethod", chap.method.as_str()),
            ("node.session.auth.username", chap.username.as_str()),
            ("node.session.auth.password", chap.password.as_str()),
        ];
        for (name, value) in settings {
            let args = node_args(iqn, portal_ref, &["--op", "update", "-n", name, "-v", value]);
            transport.iscsiadm(&args, &[]).await?;
        }
        debug!(portal = %portal_str, method = %chap.method, "Applied CHAP credentials");
    }

    for attempt in 1..=config.login_attempts {
        let sessions = list_sessions(transport).await?;
        if let Some(session) = sessions
            .iter()
            .find(|s| s.transport == "tcp" && s.portal == portal_str && s.iqn == iqn)
        {
            info!(portal = %portal_str, iqn = %iqn, session = %session.id, "iSCSI session established");
            return Ok(Session {
                id: session.id.clone(),
                manual_scan,
            });
        }

        debug!(portal = %portal_str, iqn = %iqn, attempt, "Logging in");
        transport
            .iscsiadm(&node(&["--login"]), &[ISCSI_ERR_SESS_EXISTS])
            .await?;

        if let Err(e) = transport
            .iscsiadm(
                &node(&["--op", "update", "-n", "node.startup", "-v", "automatic"]),
                &[],
            )
            .await
        {
            warn!(portal = %portal_str, error = %e, "Failed to enable automatic login on boot");
        }

        tokio::time::sleep(config.login_interval).await;
    }

    Err(ConnectorError::SessionNotEstablished {
        portal: portal_str,
        iqn: iqn.to_string(),
    })
}
