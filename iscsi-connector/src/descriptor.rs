//! Connection descriptor parsing.
//!
//! Turns the loosely typed property bag handed over by the attachment layer
//! into a validated [`ConnectionDescriptor`].

use serde_json::{Map, Value};

use crate::error::DescriptorError;
use crate::types::{ChapCredentials, Endpoint, ISCSI_DEFAULT_PORT, MultipathPolicy, Wwn};

/// Untyped connection properties as supplied by the caller.
pub type Properties = Map<String, Value>;

/// Property keys understood by the parser.
pub mod keys {
    pub const LUN_WWN: &str = "tgtLunWWN";
    pub const PORTALS: &str = "tgtPortals";
    pub const IQNS: &str = "tgtIQNs";
    pub const HOST_LUNS: &str = "tgtHostLUNs";
    pub const AUTH_USER: &str = "authUserName";
    pub const AUTH_PASSWORD: &str = "authPassword";
    pub const AUTH_METHOD: &str = "authMethod";
    pub const USE_MULTIPATH: &str = "volumeUseMultiPath";
    pub const MULTIPATH_TYPE: &str = "multiPathType";
}

/// One portal of a descriptor, handled by exactly one discovery task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalTarget {
    pub portal: Endpoint,
    pub iqn: String,
    pub host_lun: String,
}

/// Validated, immutable description of how to reach one logical unit.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub wwn: Wwn,
    pub portals: Vec<Endpoint>,
    pub iqns: Vec<String>,
    pub host_luns: Vec<String>,
    pub chap: Option<ChapCredentials>,
    pub use_multipath: bool,
    pub policy: MultipathPolicy,
}

impl ConnectionDescriptor {
    /// Parse and validate connection properties.
    pub fn from_properties(props: &Properties) -> Result<Self, DescriptorError> {
        let wwn = Wwn::parse(&required_string(props, keys::LUN_WWN)?)?;
        let portal_strings = required_string_list(props, keys::PORTALS)?;
        let iqns = required_string_list(props, keys::IQNS)?;
        let host_luns = required_string_list(props, keys::HOST_LUNS)?;

        if portal_strings.len() != iqns.len() || portal_strings.len() != host_luns.len() {
            return Err(DescriptorError::LengthMismatch {
                portals: portal_strings.len(),
                iqns: iqns.len(),
                host_luns: host_luns.len(),
            });
        }
        if portal_strings.is_empty() {
            return Err(DescriptorError::InvalidField {
                field: keys::PORTALS,
                reason: "at least one portal is required".into(),
            });
        }

        let portals = portal_strings
            .iter()
            .map(|p| {
                Endpoint::parse(p, ISCSI_DEFAULT_PORT).map_err(|e| DescriptorError::InvalidField {
                    field: keys::PORTALS,
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for iqn in &iqns {
            validate_iqn(iqn)?;
        }
        for lun in &host_luns {
            if lun.parse::<u32>().is_err() {
                return Err(DescriptorError::InvalidField {
                    field: keys::HOST_LUNS,
                    reason: format!("'{}' is not a LUN number", lun),
                });
            }
        }

        let (use_multipath, policy) = resolve_multipath(props)?;

        Ok(Self {
            wwn,
            portals,
            iqns,
            host_luns,
            chap: chap_credentials(props)?,
            use_multipath,
            policy,
        })
    }

    /// Portal targets to contact: every portal with multipath, else the first.
    pub fn targets(&self) -> Vec<PortalTarget> {
        let all = self
            .portals
            .iter()
            .zip(&self.iqns)
            .zip(&self.host_luns)
            .map(|((portal, iqn), host_lun)| PortalTarget {
                portal: portal.clone(),
                iqn: iqn.clone(),
                host_lun: host_lun.clone(),
            });

        if self.use_multipath {
            all.collect()
        } else {
            all.take(1).collect()
        }
    }
}

/// LUN WWN of a property bag, for drivers that need nothing else.
pub fn lun_wwn(props: &Properties) -> Result<Wwn, DescriptorError> {
    Wwn::parse(&required_string(props, keys::LUN_WWN)?)
}

/// Resolve the multipath flag and policy shared by all connectors.
///
/// A disabled flag always yields [`MultipathPolicy::None`]; an enabled flag
/// without a type defaults to device-mapper.
pub fn resolve_multipath(props: &Properties) -> Result<(bool, MultipathPolicy), DescriptorError> {
    let enabled = match props.get(keys::USE_MULTIPATH) {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        Some(other) => {
            return Err(DescriptorError::InvalidField {
                field: keys::USE_MULTIPATH,
                reason: format!("expected boolean, got {}", other),
            });
        }
    };

    if !enabled {
        return Ok((false, MultipathPolicy::None));
    }

    let policy = match optional_string(props, keys::MULTIPATH_TYPE)? {
        Some(tag) if !tag.trim().is_empty() => tag.parse::<MultipathPolicy>()?,
        _ => MultipathPolicy::DeviceMapper,
    };

    Ok((policy.is_multipath(), policy))
}

fn chap_credentials(props: &Properties) -> Result<Option<ChapCredentials>, DescriptorError> {
    let user = optional_string(props, keys::AUTH_USER)?.unwrap_or_default();
    let password = optional_string(props, keys::AUTH_PASSWORD)?.unwrap_or_default();
    if user.is_empty() || password.is_empty() {
        return Ok(None);
    }
    let method = optional_string(props, keys::AUTH_METHOD)?
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "CHAP".to_string());
    Ok(Some(ChapCredentials::new(user, password, method)))
}

/// Target names should only contain alphanumeric, dots, colons, and dashes.
fn validate_iqn(iqn: &str) -> Result<(), DescriptorError> {
    if iqn.is_empty() {
        return Err(DescriptorError::InvalidField {
            field: keys::IQNS,
            reason: "IQN cannot be empty".into(),
        });
    }
    let valid = iqn
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == ':' || c == '-' || c == '_');
    if !valid {
        return Err(DescriptorError::InvalidField {
            field: keys::IQNS,
            reason: format!("'{}' contains invalid characters", iqn),
        });
    }
    Ok(())
}

fn required_string(props: &Properties, key: &'static str) -> Result<String, DescriptorError> {
    optional_string(props, key)?.ok_or(DescriptorError::MissingField(key))
}

fn optional_string(props: &Properties, key: &'static str) -> Result<Option<String>, DescriptorError> {
    match props.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(DescriptorError::InvalidField {
            field: key,
            reason: format!("expected string, got {}", other),
        }),
    }
}

fn required_string_list(props: &Properties, key: &'static str) -> Result<Vec<String>, DescriptorError> {
    let items = match props.get(key) {
        None | Some(Value::Null) => return Err(DescriptorError::MissingField(key)),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(DescriptorError::InvalidField {
                field: key,
                reason: format!("expected list, got {}", other),
            });
        }
    };

    items
        .iter()
        .map(|item| match item {
            Value::String(s) => Ok(s.trim().to_string()),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(DescriptorError::InvalidField {
                field: key,
                reason: format!("unexpected list element {}", other),
            }),
        })
        .collect()
}
