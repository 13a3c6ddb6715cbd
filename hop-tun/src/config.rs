//! Interface configuration
//!
//! The engine pushes interface parameters one at a time during negotiation.
//! They are collected into an [`InterfaceConfig`] through the builder and
//! handed to an [`InterfaceConfigurator`](crate::InterfaceConfigurator) in
//! one piece once the tunnel is up.

use std::net::{IpAddr, Ipv4Addr};

use crate::error::{Error, Result};
use crate::route::Route;

/// Smallest MTU accepted for an IPv4 interface
pub const MIN_MTU: u16 = 68;

/// IPv4 address configuration for the tunnel interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Config {
    /// The IPv4 address to assign to the interface
    pub address: Ipv4Addr,
    /// Network prefix length (e.g., 24 for /24)
    pub prefix_len: u8,
}

impl Ipv4Config {
    /// Create a new IPv4 configuration
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }

    /// Create from a dotted netmask, see [`netmask_to_prefix`]
    pub fn with_netmask(address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self::new(address, netmask_to_prefix(netmask))
    }

    /// Get the network mask as an Ipv4Addr
    pub fn netmask(&self) -> Ipv4Addr {
        prefix_to_netmask(self.prefix_len)
    }

    /// Get the network address
    pub fn network(&self) -> Ipv4Addr {
        let addr: u32 = self.address.into();
        let mask: u32 = self.netmask().into();
        Ipv4Addr::from(addr & mask)
    }
}

impl std::fmt::Display for Ipv4Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Convert a prefix length to a dotted netmask
pub fn prefix_to_netmask(prefix_len: u8) -> Ipv4Addr {
    if prefix_len == 0 {
        return Ipv4Addr::new(0, 0, 0, 0);
    }
    if prefix_len >= 32 {
        return Ipv4Addr::new(255, 255, 255, 255);
    }
    let mask = !((1u32 << (32 - prefix_len)) - 1);
    Ipv4Addr::from(mask)
}

/// Convert a dotted netmask to a prefix length
///
/// Masks that are not a contiguous run of leading ones cannot be expressed
/// as a prefix; they are treated as a single host (/32).
pub fn netmask_to_prefix(netmask: Ipv4Addr) -> u8 {
    let mask = u32::from(netmask);
    let ones = mask.leading_ones();
    if mask.checked_shl(ones).unwrap_or(0) != 0 {
        log::warn!("Non-contiguous netmask {}, assuming /32", netmask);
        return 32;
    }
    ones as u8
}

/// Everything needed to bring up the tunnel interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Label of the session this interface belongs to, e.g. the gateway name
    pub session: String,
    /// Interface name (optional, chosen by the host if not specified)
    pub name: Option<String>,
    /// IPv4 configuration
    pub ipv4: Ipv4Config,
    /// Maximum transmission unit, host default if unset
    pub mtu: Option<u16>,
    /// DNS servers used while connected
    pub dns: Vec<IpAddr>,
    /// Routes sent through the interface
    pub routes: Vec<Route>,
    /// DNS search domain
    pub search_domain: Option<String>,
}

impl InterfaceConfig {
    /// Create a new configuration builder
    pub fn builder() -> InterfaceConfigBuilder {
        InterfaceConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.ipv4.prefix_len > 32 {
            return Err(Error::InvalidPrefix(format!(
                "IPv4 prefix length {} is invalid (max 32)",
                self.ipv4.prefix_len
            )));
        }

        if self.ipv4.address.is_unspecified() {
            return Err(Error::InvalidAddress(self.ipv4.address.to_string()));
        }

        if let Some(mtu) = self.mtu {
            if mtu < MIN_MTU {
                return Err(Error::Config(format!(
                    "MTU {} is too small (minimum {})",
                    mtu, MIN_MTU
                )));
            }
        }

        if let Some(ref domain) = self.search_domain {
            if domain.is_empty() || domain.contains(char::is_whitespace) {
                return Err(Error::Config(format!("invalid search domain '{}'", domain)));
            }
        }

        Ok(())
    }
}

/// Builder for InterfaceConfig
///
/// Parameters may arrive in any order; only the address is mandatory.
#[derive(Debug, Default, Clone)]
pub struct InterfaceConfigBuilder {
    session: String,
    name: Option<String>,
    ipv4: Option<Ipv4Config>,
    mtu: Option<u16>,
    dns: Vec<IpAddr>,
    routes: Vec<Route>,
    search_domain: Option<String>,
}

impl InterfaceConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session label
    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    /// Set the interface name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the IPv4 address and prefix length
    pub fn ipv4(mut self, address: impl Into<Ipv4Addr>, prefix_len: u8) -> Self {
        self.ipv4 = Some(Ipv4Config::new(address.into(), prefix_len));
        self
    }

    /// Set the IPv4 address with a dotted netmask
    pub fn ipv4_netmask(mut self, address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        self.ipv4 = Some(Ipv4Config::with_netmask(address, netmask));
        self
    }

    /// Set the MTU
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Add a DNS server, duplicates are ignored
    pub fn dns(mut self, server: IpAddr) -> Self {
        if !self.dns.contains(&server) {
            self.dns.push(server);
        }
        self
    }

    /// Add a route, duplicates are ignored
    pub fn route(mut self, route: Route) -> Self {
        if !self.routes.contains(&route) {
            self.routes.push(route);
        }
        self
    }

    /// Set the DNS search domain
    pub fn search_domain(mut self, domain: impl Into<String>) -> Self {
        self.search_domain = Some(domain.into());
        self
    }

    /// An address has been supplied
    pub fn has_address(&self) -> bool {
        self.ipv4.is_some()
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<InterfaceConfig> {
        let ipv4 = self
            .ipv4
            .ok_or_else(|| Error::Config("an IPv4 address must be configured".into()))?;

        let config = InterfaceConfig {
            session: self.session,
            name: self.name,
            ipv4,
            mtu: self.mtu,
            dns: self.dns,
            routes: self.routes,
            search_domain: self.search_domain,
        };
        config.validate()?;
        Ok(config)
    }
}
