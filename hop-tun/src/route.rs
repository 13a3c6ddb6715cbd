//! Routes pushed through the tunnel interface

use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net};

use crate::config::netmask_to_prefix;
use crate::error::{Error, Result};

/// A network route entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network
    pub destination: IpNet,
    /// Gateway address (None for routes straight into the interface)
    pub gateway: Option<IpAddr>,
}

impl Route {
    /// Route a destination network into the interface
    pub fn new(destination: IpNet) -> Self {
        Self {
            destination,
            gateway: None,
        }
    }

    /// Create a new IPv4 route
    pub fn ipv4(dest_addr: Ipv4Addr, prefix_len: u8, gateway: Option<Ipv4Addr>) -> Result<Self> {
        let destination =
            Ipv4Net::new(dest_addr, prefix_len).map_err(|e| Error::InvalidPrefix(e.to_string()))?;

        Ok(Self {
            destination: IpNet::V4(destination.trunc()),
            gateway: gateway.map(IpAddr::V4),
        })
    }

    /// Create an IPv4 route from a network and dotted netmask
    ///
    /// Host bits in `network` are cleared. A non-contiguous netmask yields
    /// a host route.
    pub fn from_netmask(network: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self> {
        Self::ipv4(network, netmask_to_prefix(netmask), None)
    }

    /// Set the gateway for this route
    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Check if this is a default route
    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }

    /// Check if this is an IPv4 route
    pub fn is_ipv4(&self) -> bool {
        matches!(self.destination, IpNet::V4(_))
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(ref gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        Ok(())
    }
}
