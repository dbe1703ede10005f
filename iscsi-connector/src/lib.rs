//! iSCSI Volume Connector Library
//!
//! Host-side attach/detach engine for block volumes exported over iSCSI.
//!
//! This library provides:
//! - Connection descriptor parsing and validation
//! - Concurrent per-portal session login and SCSI device discovery
//! - Device-mapper and vendor multipath reconciliation and verification
//! - Idempotent teardown of devices and unused sessions

pub mod config;
pub mod connector;
pub mod descriptor;
pub mod error;
pub mod exec;
pub mod iscsi;
pub mod local;
pub mod metrics;
pub mod platform;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{ConnectorConfig, ToolPaths};
pub use connector::{Connector, ConnectorRegistry};
pub use descriptor::{ConnectionDescriptor, Properties};
pub use error::{ConnectorError, DescriptorError, ExecError, Result};
pub use exec::{CommandOutput, CommandRunner, SystemRunner};
pub use iscsi::IscsiConnector;
pub use local::LocalConnector;
pub use types::{MultipathPolicy, Protocol, Wwn};
