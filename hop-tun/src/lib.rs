//! Tunnel interface configuration
//!
//! The tunnel engine negotiates the interface parameters (address, MTU,
//! routes, DNS) with the gateway; this crate collects them into an
//! [`InterfaceConfig`] and defines the [`InterfaceConfigurator`] capability
//! the host implements to create the actual interface.
//!
//! # Example
//!
//! ```
//! use std::net::Ipv4Addr;
//! use hop_tun::{InterfaceConfig, Route};
//!
//! let config = InterfaceConfig::builder()
//!     .session("gateway1")
//!     .ipv4_netmask(Ipv4Addr::new(10, 8, 0, 2), Ipv4Addr::new(255, 255, 255, 0))
//!     .mtu(1500)
//!     .route(Route::from_netmask(Ipv4Addr::new(0, 0, 0, 0), Ipv4Addr::new(128, 0, 0, 0)).unwrap())
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.ipv4.prefix_len, 24);
//! assert_eq!(config.routes[0].to_string(), "0.0.0.0/1");
//! ```

pub mod config;
pub mod error;
pub mod interface;
pub mod route;

pub use config::{netmask_to_prefix, prefix_to_netmask, InterfaceConfig, InterfaceConfigBuilder, Ipv4Config};
pub use error::{Error, Result};
pub use interface::{InterfaceConfigurator, TunnelInterface};
pub use route::Route;
