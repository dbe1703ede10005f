//! Transport driver registry.
//!
//! Drivers are looked up by their [`Protocol`] tag; the registry is built
//! once at start-up and shared read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConnectorConfig;
use crate::descriptor::Properties;
use crate::error::{ConnectorError, Result};
use crate::exec::CommandRunner;
use crate::iscsi::IscsiConnector;
use crate::local::LocalConnector;
use crate::types::Protocol;

/// A transport driver able to attach and detach volumes.
#[async_trait]
pub trait Connector: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Attach a volume and return the device path users should open.
    async fn connect_volume(&self, properties: &Properties) -> Result<String>;

    /// Detach the volume with the given WWN.
    async fn disconnect_volume(&self, wwn: &str) -> Result<()>;
}

#[async_trait]
impl Connector for IscsiConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Iscsi
    }

    async fn connect_volume(&self, properties: &Properties) -> Result<String> {
        IscsiConnector::connect_volume(self, properties).await
    }

    async fn disconnect_volume(&self, wwn: &str) -> Result<()> {
        IscsiConnector::disconnect_volume(self, wwn).await
    }
}

#[async_trait]
impl Connector for LocalConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Local
    }

    async fn connect_volume(&self, properties: &Properties) -> Result<String> {
        LocalConnector::connect_volume(self, properties).await
    }

    async fn disconnect_volume(&self, wwn: &str) -> Result<()> {
        LocalConnector::disconnect_volume(self, wwn).await
    }
}

#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<Protocol, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the iSCSI and local drivers sharing one configuration.
    pub fn with_defaults(config: ConnectorConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IscsiConnector::new(config.clone(), runner.clone())));
        registry.register(Arc::new(LocalConnector::new(config, runner)));
        registry
    }

    /// Add a driver, replacing any previous driver for the same protocol.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.protocol(), connector);
    }

    pub fn get(&self, protocol: Protocol) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&protocol).cloned()
    }

    /// Look a driver up by its textual tag.
    pub fn for_tag(&self, tag: &str) -> Result<Arc<dyn Connector>> {
        let protocol: Protocol = tag
            .parse()
            .map_err(|_| ConnectorError::UnknownProtocol(tag.to_string()))?;
        self.get(protocol)
            .ok_or_else(|| ConnectorError::UnknownProtocol(tag.to_string()))
    }
}
