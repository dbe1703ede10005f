//! Type-safe wrappers for connection parameters.
//!
//! These types provide compile-time safety for values that arrive as loosely
//! typed connection properties. Each type implements `FromStr` for parsing at
//! the API boundary.

use std::fmt::{self, Display};
use std::str::FromStr;

use crate::error::DescriptorError;

// ============================================================================
// MultipathPolicy
// ============================================================================

/// How the paths of one logical unit are aggregated on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultipathPolicy {
    /// Single path, no aggregation (default)
    #[default]
    None,
    /// Linux device-mapper multipath (multipathd)
    DeviceMapper,
    /// Vendor multipath driver for SCSI disks
    UltraPath,
    /// Vendor multipath driver for NVMe disks
    UltraPathNvme,
}

impl MultipathPolicy {
    /// Tag understood by the multipath-detection helper for this policy.
    pub const fn tag(self) -> &'static str {
        match self {
            MultipathPolicy::None => "none",
            MultipathPolicy::DeviceMapper => "DM-multipath",
            MultipathPolicy::UltraPath => "HW-UltraPath",
            MultipathPolicy::UltraPathNvme => "HW-UltraPath-NVMe",
        }
    }

    /// Returns true for policies that fan out over every portal.
    pub const fn is_multipath(self) -> bool {
        !matches!(self, MultipathPolicy::None)
    }

    /// Returns true for the vendor-managed policies.
    pub const fn is_vendor(self) -> bool {
        matches!(
            self,
            MultipathPolicy::UltraPath | MultipathPolicy::UltraPathNvme
        )
    }
}

impl Display for MultipathPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for MultipathPolicy {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(MultipathPolicy::None),
            "dm-multipath" | "dm" | "device-mapper" => Ok(MultipathPolicy::DeviceMapper),
            "hw-ultrapath" | "ultrapath" => Ok(MultipathPolicy::UltraPath),
            "hw-ultrapath-nvme" | "ultrapath-nvme" => Ok(MultipathPolicy::UltraPathNvme),
            _ => Err(DescriptorError::UnsupportedMultiPathType(s.to_string())),
        }
    }
}

// ============================================================================
// Protocol
// ============================================================================

/// Transport driver used to attach a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    /// iSCSI sessions (default)
    #[default]
    Iscsi,
    /// LUN already visible to the host
    Local,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Iscsi => write!(f, "iscsi"),
            Protocol::Local => write!(f, "local"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "iscsi" => Ok(Protocol::Iscsi),
            "local" => Ok(Protocol::Local),
            _ => Err(ProtocolParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid protocol tag.
#[derive(Debug, Clone)]
pub struct ProtocolParseError(pub String);

impl Display for ProtocolParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown protocol '{}': expected 'iscsi' or 'local'",
            self.0
        )
    }
}

impl std::error::Error for ProtocolParseError {}

// ============================================================================
// Wwn
// ============================================================================

/// World-wide name of a logical unit as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Wwn(String);

impl Wwn {
    pub fn parse(s: &str) -> Result<Self, DescriptorError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DescriptorError::InvalidField {
                field: "tgtLunWWN",
                reason: "WWN cannot be empty".into(),
            });
        }
        if !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DescriptorError::InvalidField {
                field: "tgtLunWWN",
                reason: format!("'{}' is not alphanumeric", s),
            });
        }
        Ok(Self(s.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SCSI identifier the multipath tools use for an NAA-6 LUN.
    pub fn scsi_id(&self) -> String {
        format!("3{}", self.0)
    }

    /// Check whether an identifier read from sysfs or a tool refers to this LUN.
    pub fn matches(&self, identifier: &str) -> bool {
        identifier.to_lowercase().contains(&self.0)
    }
}

impl Display for Wwn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a sysfs `device/wwid` value into the identifier multipath uses.
///
/// `naa.6001...` becomes `36001...`; `t10.` and `eui.` map to `1` and `2`.
pub fn normalize_wwid(raw: &str) -> String {
    let raw = raw.trim();
    let prefixes = [("t10.", '1'), ("eui.", '2'), ("naa.", '3')];
    for (prefix, kind) in prefixes {
        if let Some(rest) = raw.strip_prefix(prefix) {
            return format!("{}{}", kind, rest.to_lowercase());
        }
    }
    raw.to_lowercase()
}

// ============================================================================
// ChapCredentials
// ============================================================================

/// CHAP credentials applied to a node record before login.
#[derive(Clone, PartialEq, Eq)]
pub struct ChapCredentials {
    /// Initiator username
    pub username: String,
    /// Initiator secret
    pub password: String,
    /// Authentication method (e.g. "CHAP")
    pub method: String,
}

impl ChapCredentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            method: method.into(),
        }
    }
}

impl fmt::Debug for ChapCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChapCredentials")
            .field("username", &self.username)
            .field("password", &"******")
            .field("method", &self.method)
            .finish()
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// Default iSCSI portal port.
pub const ISCSI_DEFAULT_PORT: u16 = 3260;

/// An iSCSI target portal (host:port).
///
/// The host can be an IP address (v4 or v6) or a hostname - no resolution is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host address (IP or hostname, not resolved)
    pub host: String,
    /// Port number
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint with explicit host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Format as the portal string iscsiadm prints and expects.
    ///
    /// IPv6 hosts are bracketed: `[fd00::1]:3260`.
    pub fn to_portal_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Parse a single portal string, falling back to `default_port`.
    ///
    /// # Examples
    /// - "10.0.0.1:3260" → explicit port
    /// - "10.0.0.1" → default port
    /// - "[::1]:3260" → IPv6 with port
    pub fn parse(s: &str, default_port: u16) -> Result<Self, EndpointParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointParseError(s.to_string()));
        }

        // Handle IPv6 with brackets: [::1]:port
        if s.starts_with('[') {
            if let Some(bracket_end) = s.find(']') {
                let host = &s[1..bracket_end];
                let rest = &s[bracket_end + 1..];

                if rest.is_empty() {
                    return Ok(Endpoint::new(host, default_port));
                } else if let Some(port_str) = rest.strip_prefix(':') {
                    let port = port_str
                        .parse::<u16>()
                        .map_err(|_| EndpointParseError(s.to_string()))?;
                    return Ok(Endpoint::new(host, port));
                }
            }
            return Err(EndpointParseError(s.to_string()));
        }

        // More than one colon without brackets is a bare IPv6 address
        if s.matches(':').count() > 1 {
            return Ok(Endpoint::new(s, default_port));
        }

        if let Some((host, port)) = s.rsplit_once(':') {
            if host.is_empty() {
                return Err(EndpointParseError(s.to_string()));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| EndpointParseError(s.to_string()))?;
            return Ok(Endpoint::new(host, port));
        }

        Ok(Endpoint::new(s, default_port))
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_portal_string())
    }
}

/// Error returned when parsing an invalid endpoint.
#[derive(Debug, Clone)]
pub struct EndpointParseError(String);

impl Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid portal '{}': expected 'host:port' or 'host'", self.0)
    }
}

impl std::error::Error for EndpointParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipath_policy_from_str() {
        assert_eq!(
            "DM-multipath".parse::<MultipathPolicy>().unwrap(),
            MultipathPolicy::DeviceMapper
        );
        assert_eq!(
            "HW-UltraPath".parse::<MultipathPolicy>().unwrap(),
            MultipathPolicy::UltraPath
        );
        assert_eq!(
            "hw-ultrapath-nvme".parse::<MultipathPolicy>().unwrap(),
            MultipathPolicy::UltraPathNvme
        );
        assert_eq!(
            "".parse::<MultipathPolicy>().unwrap(),
            MultipathPolicy::None
        );
        assert!(matches!(
            "powerpath".parse::<MultipathPolicy>(),
            Err(DescriptorError::UnsupportedMultiPathType(_))
        ));
    }

    #[test]
    fn test_multipath_policy_display_roundtrip() {
        for policy in [
            MultipathPolicy::None,
            MultipathPolicy::DeviceMapper,
            MultipathPolicy::UltraPath,
            MultipathPolicy::UltraPathNvme,
        ] {
            assert_eq!(policy.to_string().parse::<MultipathPolicy>().unwrap(), policy);
        }
        assert!(!MultipathPolicy::None.is_multipath());
        assert!(MultipathPolicy::UltraPath.is_vendor());
        assert!(!MultipathPolicy::DeviceMapper.is_vendor());
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("iscsi".parse::<Protocol>().unwrap(), Protocol::Iscsi);
        assert_eq!("LOCAL".parse::<Protocol>().unwrap(), Protocol::Local);
        assert!("fc".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_wwn_parse_and_match() {
        let wwn = Wwn::parse(" 600ABC ").unwrap();
        assert_eq!(wwn.as_str(), "600abc");
        assert_eq!(wwn.scsi_id(), "3600abc");
        assert!(wwn.matches("naa.600ABC"));
        assert!(!wwn.matches("naa.600abd"));
        assert!(Wwn::parse("").is_err());
        assert!(Wwn::parse("600 abc").is_err());
    }

    #[test]
    fn test_normalize_wwid() {
        assert_eq!(normalize_wwid("naa.600ABC\n"), "3600abc");
        assert_eq!(normalize_wwid("t10.XYZ"), "1xyz");
        assert_eq!(normalize_wwid("eui.0011"), "20011");
        assert_eq!(normalize_wwid("3600abc"), "3600abc");
    }

    #[test]
    fn test_chap_debug_hides_password() {
        let chap = ChapCredentials::new("user", "s3cret", "CHAP");
        let debug = format!("{:?}", chap);
        assert!(debug.contains("user"));
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn test_endpoint_parse() {
        let ep = Endpoint::parse("10.0.0.1:3261", ISCSI_DEFAULT_PORT).unwrap();
        assert_eq!(ep, Endpoint::new("10.0.0.1", 3261));

        let ep = Endpoint::parse("10.0.0.1", ISCSI_DEFAULT_PORT).unwrap();
        assert_eq!(ep.to_portal_string(), "10.0.0.1:3260");

        let ep = Endpoint::parse("[fd00::1]:3260", ISCSI_DEFAULT_PORT).unwrap();
        assert_eq!(ep.host, "fd00::1");
        assert_eq!(ep.to_portal_string(), "[fd00::1]:3260");

        let ep = Endpoint::parse("fd00::2", ISCSI_DEFAULT_PORT).unwrap();
        assert_eq!(ep.host, "fd00::2");
        assert_eq!(ep.port, 3260);

        let ep = Endpoint::parse("storage.example.com", ISCSI_DEFAULT_PORT).unwrap();
        assert_eq!(ep.to_string(), "storage.example.com:3260");
    }

    #[test]
    fn test_endpoint_parse_invalid() {
        assert!(Endpoint::parse("", 3260).is_err());
        assert!(Endpoint::parse("10.0.0.1:http", 3260).is_err());
        assert!(Endpoint::parse(":3260", 3260).is_err());
        assert!(Endpoint::parse("[::1", 3260).is_err());
    }
}
