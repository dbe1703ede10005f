use thiserror::Error;

/// Errors raised while validating the caller's connection properties.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' has invalid value: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error(
        "portal/IQN/host-LUN lists differ in length: {portals} portals, {iqns} IQNs, {host_luns} host LUNs"
    )]
    LengthMismatch {
        portals: usize,
        iqns: usize,
        host_luns: usize,
    },

    #[error("unsupported multipath type '{0}'")]
    UnsupportedMultiPathType(String),
}

/// Errors raised by the process execution collaborator.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("command '{0}' timed out")]
    Timeout(String),

    #[error("failed to execute '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Error taxonomy of the attach/detach engine.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("invalid connection properties: {0}")]
    Validation(#[from] DescriptorError),

    #[error("{tool} timed out: {command}")]
    Timeout { tool: String, command: String },

    #[error("{tool} failed with exit code {code:?}: {command}: {output}")]
    ToolInvocation {
        tool: String,
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("failed to execute {tool}: {source}")]
    ToolUnavailable {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no iSCSI session established to {portal} for {iqn}")]
    SessionNotEstablished { portal: String, iqn: String },

    #[error("no device found for LUN {wwn}")]
    DeviceNotFound { wwn: String },

    #[error("volume {wwn} not found: {reason}")]
    VolumeNotFound { wwn: String, reason: String },

    #[error("none of the target portals is reachable: {0}")]
    NoReachablePortal(String),

    #[error("device {device} failed verification: {reason}")]
    VerificationFailed { device: String, reason: String },

    #[error("unknown transport protocol '{0}'")]
    UnknownProtocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectorError {
    pub(crate) fn volume_not_found(wwn: impl Into<String>, reason: impl Into<String>) -> Self {
        ConnectorError::VolumeNotFound {
            wwn: wwn.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn verification(device: impl Into<String>, reason: impl Into<String>) -> Self {
        ConnectorError::VerificationFailed {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// True when the error came from a command exceeding its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectorError::Timeout { .. })
    }

    /// Short label used as the metrics status.
    pub fn code(&self) -> &'static str {
        match self {
            ConnectorError::Validation(DescriptorError::UnsupportedMultiPathType(_)) => {
                "unsupported_multipath_type"
            }
            ConnectorError::Validation(_) => "invalid_argument",
            ConnectorError::Timeout { .. } => "timeout",
            ConnectorError::ToolInvocation { .. } => "tool_error",
            ConnectorError::ToolUnavailable { .. } => "tool_unavailable",
            ConnectorError::SessionNotEstablished { .. } => "session_not_established",
            ConnectorError::DeviceNotFound { .. } => "device_not_found",
            ConnectorError::VolumeNotFound { .. } => "volume_not_found",
            ConnectorError::NoReachablePortal(_) => "no_reachable_portal",
            ConnectorError::VerificationFailed { .. } => "verification_failed",
            ConnectorError::UnknownProtocol(_) => "unknown_protocol",
            ConnectorError::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
