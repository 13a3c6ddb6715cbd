//! The host capability that turns an [`InterfaceConfig`] into a live interface

use async_trait::async_trait;

use crate::config::{InterfaceConfig, Ipv4Config};
use crate::error::Result;

/// A tunnel interface brought up by an [`InterfaceConfigurator`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInterface {
    /// Name the host gave the interface
    pub name: String,
    /// Address assigned to it
    pub address: Ipv4Config,
    /// The configuration it was created from
    pub config: InterfaceConfig,
}

impl TunnelInterface {
    /// Describe an interface created from `config`
    ///
    /// The requested name is used when the host did not pick its own.
    pub fn new(name: Option<String>, config: InterfaceConfig) -> Self {
        let name = name
            .or_else(|| config.name.clone())
            .unwrap_or_else(|| format!("tun-{}", config.session));
        Self {
            name,
            address: config.ipv4,
            config,
        }
    }
}

/// Creates and removes the host's tunnel interface
///
/// There is a single interface at a time: `establish` replaces whatever a
/// previous call created.
#[async_trait]
pub trait InterfaceConfigurator: Send + Sync {
    /// Bring up an interface with the given parameters
    async fn establish(&self, config: &InterfaceConfig) -> Result<TunnelInterface>;

    /// Tear down an interface returned by `establish`
    async fn release(&self, interface: &TunnelInterface) -> Result<()>;
}
