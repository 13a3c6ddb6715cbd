//! Gatehop Engine
//!
//! Control plane for an obfuscated tunnel: it picks a gateway, starts the
//! obfuscation transport when the route needs one, drives the external
//! tunnel engine over its management channel and configures the host
//! interface once the tunnel is up.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                        │
//! │  ┌─────────────────┐              ┌─────────────────────┐   │
//! │  │   gatehop-cli   │              │   Other front ends  │   │
//! │  └────────┬────────┘              └──────────┬──────────┘   │
//! │           └───────────────┬──────────────────┘              │
//! │                           ▼                                 │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │                   gatehop-engine                       │ │
//! │  │  - TunnelController (state machine, caller API)        │ │
//! │  │  - GatewayCatalog (gateway ranking and selection)      │ │
//! │  │  - TransportSupervisor (obfs4 proxy process)           │ │
//! │  │  - Config (TOML configuration)                         │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Library Layer                            │
//! │  ┌─────────────────┐    ┌─────────────────┐                 │
//! │  │    hop-mgmt     │    │    hop-tun      │                 │
//! │  │  - Commands     │    │  - Iface config │                 │
//! │  │  - Events       │    │  - Routes       │                 │
//! │  │  - Framing      │    │  - Configurator │                 │
//! │  └─────────────────┘    └─────────────────┘                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod connector;
pub mod controller;
pub mod error;
pub mod event;
pub mod gateway;
pub mod script;
pub mod session;
pub mod transport;

pub use config::{ChannelConfig, ChannelMode, Config, InterfaceSettings, ScorerKind, SelectionConfig, TransportConfig};
#[cfg(unix)]
pub use connector::UnixSocketConnector;
pub use connector::{AsyncStream, BoxedStream, ChannelConnector, TcpConnector};
pub use controller::TunnelController;
pub use error::{Error, Result};
pub use event::{ConnectionState, FailureKind, TunnelEvent};
pub use gateway::{
    plan_route, Gateway, GatewayCatalog, GatewayScorer, SelectionCriteria, TimezoneScorer, Transport,
    TransportPreference, TransportSpec, UniformScorer,
};
pub use script::{NoopConfigurator, ScriptConfigurator};
pub use session::ControlSession;
pub use transport::{Obfs4Params, TransportExit, TransportProcess, TransportSupervisor};
