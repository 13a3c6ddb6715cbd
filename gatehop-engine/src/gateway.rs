//! Gateway catalog and selection
//!
//! Gateways are ingested from the configuration file or from a JSON
//! document handed in by the caller. The catalog only orders them; it never
//! touches the network.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::Obfs4Params;

/// How a gateway can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportSpec {
    /// Plain connection to the gateway
    Direct {
        /// Remote ports, the first one is used
        ports: Vec<u16>,
    },
    /// Connection through a local obfs4 proxy
    Obfs4 {
        /// Remote ports of the obfs4 bridge, the first one is used
        ports: Vec<u16>,
        /// Bridge certificate
        cert: String,
        /// Inter-arrival time mode
        #[serde(default)]
        iat_mode: u8,
    },
}

impl TransportSpec {
    fn validate(&self, gateway: &str) -> Result<()> {
        let ports = match self {
            TransportSpec::Direct { ports } => ports,
            TransportSpec::Obfs4 { ports, cert, .. } => {
                if cert.is_empty() {
                    return Err(Error::Config(format!(
                        "gateway {}: obfs4 transport requires a cert",
                        gateway
                    )));
                }
                ports
            }
        };

        if ports.is_empty() || ports.contains(&0) {
            return Err(Error::Config(format!(
                "gateway {}: transport ports must be non-empty and non-zero",
                gateway
            )));
        }
        Ok(())
    }
}

/// A candidate tunnel endpoint
///
/// Two gateways are the same gateway when host, address and name match,
/// whatever their capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    /// Host name
    pub host: String,

    /// Address the tunnel is dialed at
    pub ip_address: IpAddr,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Location name, e.g. "Amsterdam"
    #[serde(default)]
    pub location: Option<String>,

    /// UTC offset of the gateway's location, in hours
    #[serde(default)]
    pub timezone: Option<i32>,

    /// Supported transports
    #[serde(default)]
    pub transports: Vec<TransportSpec>,
}

impl PartialEq for Gateway {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.ip_address == other.ip_address && self.name == other.name
    }
}

impl Eq for Gateway {}

impl Hash for Gateway {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.ip_address.hash(state);
        self.name.hash(state);
    }
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = if self.name.is_empty() { &self.host } else { &self.name };
        write!(f, "{} ({})", label, self.ip_address)
    }
}

impl Gateway {
    /// Validate the gateway definition
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config(format!("gateway {} has no host", self.ip_address)));
        }
        if self.transports.is_empty() {
            return Err(Error::Config(format!("gateway {} has no transports", self.host)));
        }
        if let Some(tz) = self.timezone {
            if !(-12..=14).contains(&tz) {
                return Err(Error::Config(format!(
                    "gateway {}: timezone {} out of range",
                    self.host, tz
                )));
            }
        }
        for transport in &self.transports {
            transport.validate(&self.host)?;
        }
        Ok(())
    }

    /// Label used for the session and in logs
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.host
        } else {
            &self.name
        }
    }

    /// Address for a plain connection, if the gateway offers one
    pub fn direct_addr(&self) -> Option<SocketAddr> {
        self.transports.iter().find_map(|t| match t {
            TransportSpec::Direct { ports } => ports.first().map(|p| SocketAddr::new(self.ip_address, *p)),
            _ => None,
        })
    }

    /// Bridge address and parameters for an obfs4 connection
    pub fn obfs4(&self) -> Option<(SocketAddr, Obfs4Params)> {
        self.transports.iter().find_map(|t| match t {
            TransportSpec::Obfs4 {
                ports,
                cert,
                iat_mode,
            } => ports.first().map(|p| {
                (
                    SocketAddr::new(self.ip_address, *p),
                    Obfs4Params {
                        cert: cert.clone(),
                        iat_mode: *iat_mode,
                    },
                )
            }),
            _ => None,
        })
    }

    /// Check if a plain connection is offered
    pub fn supports_direct(&self) -> bool {
        self.direct_addr().is_some()
    }

    /// Check if an obfs4 connection is offered
    pub fn supports_obfs4(&self) -> bool {
        self.obfs4().is_some()
    }
}

/// Ranks gateways by expected closeness; higher is closer
pub trait GatewayScorer: Send + Sync {
    fn score(&self, gateway: &Gateway) -> f64;
}

/// Scores gateways by how far their timezone is from the local one
///
/// Used when no latency measurements exist. Distance wraps around the
/// clock, so UTC-11 and UTC+12 are one hour apart. Gateways without a
/// timezone rank below all others.
#[derive(Debug, Clone, Copy)]
pub struct TimezoneScorer {
    local_offset: i32,
}

impl TimezoneScorer {
    /// Create a scorer for the given local UTC offset in hours
    pub fn new(local_offset: i32) -> Self {
        Self { local_offset }
    }

    /// Hours between two UTC offsets on a 24 hour clock
    pub fn distance(a: i32, b: i32) -> i32 {
        let d = (a - b).rem_euclid(24);
        d.min(24 - d)
    }
}

impl GatewayScorer for TimezoneScorer {
    fn score(&self, gateway: &Gateway) -> f64 {
        match gateway.timezone {
            Some(tz) => f64::from(12 - Self::distance(self.local_offset, tz)),
            None => -1.0,
        }
    }
}

/// Scores every gateway the same, keeping catalog order
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformScorer;

impl GatewayScorer for UniformScorer {
    fn score(&self, _gateway: &Gateway) -> f64 {
        0.0
    }
}

/// Which transport the caller wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// Direct when offered, obfs4 otherwise
    #[default]
    Auto,
    /// Only plain connections
    Direct,
    /// Only obfuscated connections
    Obfs4,
}

impl std::str::FromStr for TransportPreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(TransportPreference::Auto),
            "direct" => Ok(TransportPreference::Direct),
            "obfs4" => Ok(TransportPreference::Obfs4),
            other => Err(Error::Config(format!("unknown transport preference '{}'", other))),
        }
    }
}

/// What the caller asks [`GatewayCatalog`] for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionCriteria {
    /// How many of the closest gateways to consider
    pub closest: usize,
    /// Transport preference
    pub transport: TransportPreference,
    /// Only gateways at this location (case-insensitive)
    pub location: Option<String>,
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        Self {
            closest: 1,
            transport: TransportPreference::Auto,
            location: None,
        }
    }
}

/// How to reach a selected gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Dial the gateway directly
    Direct { addr: SocketAddr },
    /// Start a local obfs4 proxy towards `remote` and dial the proxy
    Obfs4 {
        remote: SocketAddr,
        params: Obfs4Params,
    },
}

impl Transport {
    /// Check if this route needs the obfuscation transport
    pub fn is_obfuscated(&self) -> bool {
        matches!(self, Transport::Obfs4 { .. })
    }
}

/// Decide how to reach `gateway` under `preference`
///
/// Returns `None` when the gateway cannot satisfy the preference.
pub fn plan_route(gateway: &Gateway, preference: TransportPreference) -> Option<Transport> {
    let direct = || gateway.direct_addr().map(|addr| Transport::Direct { addr });
    let obfs4 = || {
        gateway
            .obfs4()
            .map(|(remote, params)| Transport::Obfs4 { remote, params })
    };

    match preference {
        TransportPreference::Auto => direct().or_else(obfs4),
        TransportPreference::Direct => direct(),
        TransportPreference::Obfs4 => obfs4(),
    }
}

/// Ordered, deduplicated set of gateways
#[derive(Debug, Clone, Default)]
pub struct GatewayCatalog {
    gateways: Vec<Gateway>,
}

impl GatewayCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from gateways, dropping duplicates
    pub fn with_gateways(gateways: impl IntoIterator<Item = Gateway>) -> Self {
        let mut catalog = Self::new();
        catalog.replace_all(gateways);
        catalog
    }

    /// Parse a JSON array of gateway definitions
    pub fn from_json(json: &str) -> Result<Self> {
        let mut catalog = Self::new();
        catalog.extend_from_json(json)?;
        Ok(catalog)
    }

    /// Replace the whole set; the first of several equal gateways is kept
    pub fn replace_all(&mut self, gateways: impl IntoIterator<Item = Gateway>) {
        self.gateways.clear();
        self.extend(gateways);
    }

    /// Append gateways not yet in the catalog, returns how many were added
    pub fn extend(&mut self, gateways: impl IntoIterator<Item = Gateway>) -> usize {
        let mut seen: HashSet<Gateway> = self.gateways.iter().cloned().collect();
        let before = self.gateways.len();
        for gateway in gateways {
            if seen.insert(gateway.clone()) {
                self.gateways.push(gateway);
            } else {
                log::debug!("Skipping duplicate gateway {}", gateway);
            }
        }
        self.gateways.len() - before
    }

    /// Parse a JSON array and append its gateways
    ///
    /// The document is rejected as a whole if any entry is invalid.
    pub fn extend_from_json(&mut self, json: &str) -> Result<usize> {
        let gateways: Vec<Gateway> = serde_json::from_str(json)?;
        for gateway in &gateways {
            gateway.validate()?;
        }
        Ok(self.extend(gateways))
    }

    /// Number of gateways
    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    /// Check if there are no gateways
    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    /// Iterate in catalog order
    pub fn iter(&self) -> impl Iterator<Item = &Gateway> {
        self.gateways.iter()
    }

    /// Check if an equal gateway is in the catalog
    pub fn contains(&self, gateway: &Gateway) -> bool {
        self.gateways.contains(gateway)
    }

    /// Up to `n` gateways, closest first
    ///
    /// Equal scores keep catalog order. NaN scores rank last.
    pub fn select_closest(&self, n: usize, scorer: &dyn GatewayScorer) -> Vec<Gateway> {
        let mut scored: Vec<(f64, &Gateway)> = self
            .gateways
            .iter()
            .map(|g| {
                let score = scorer.score(g);
                (if score.is_nan() { f64::NEG_INFINITY } else { score }, g)
            })
            .collect();

        // stable, so ties keep their order
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        scored.into_iter().take(n).map(|(_, g)| g.clone()).collect()
    }

    /// Pick the closest gateway satisfying `criteria`, with its route
    pub fn select(&self, criteria: &SelectionCriteria, scorer: &dyn GatewayScorer) -> Result<(Gateway, Transport)> {
        if self.is_empty() {
            return Err(Error::NoGatewayAvailable("the gateway catalog is empty".into()));
        }

        let candidates: Vec<&Gateway> = match criteria.location {
            Some(ref location) => self
                .gateways
                .iter()
                .filter(|g| {
                    g.location
                        .as_deref()
                        .is_some_and(|l| l.eq_ignore_ascii_case(location))
                })
                .collect(),
            None => self.gateways.iter().collect(),
        };

        let filtered = GatewayCatalog {
            gateways: candidates.into_iter().cloned().collect(),
        };

        filtered
            .select_closest(criteria.closest.max(1), scorer)
            .into_iter()
            .find_map(|g| plan_route(&g, criteria.transport).map(|t| (g, t)))
            .ok_or_else(|| {
                Error::NoGatewayAvailable(format!(
                    "no gateway matches transport {:?}{}",
                    criteria.transport,
                    criteria
                        .location
                        .as_ref()
                        .map(|l| format!(" at {}", l))
                        .unwrap_or_default()
                ))
            })
    }
}
