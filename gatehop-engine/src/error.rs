//! Error types for the tunnel engine

use std::time::Duration;

use thiserror::Error;

use crate::event::FailureKind;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while bringing up or running a tunnel
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Failed to parse a gateway document
    #[error("failed to parse gateway list: {0}")]
    GatewayParse(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Control channel protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] hop_mgmt::Error),

    /// Interface configuration error
    #[error("TUN error: {0}")]
    Tun(#[from] hop_tun::Error),

    /// The transport binary is missing or unusable
    #[error("transport binary unavailable: {0}")]
    TransportInstallFailed(String),

    /// The transport did not announce its local port in time
    #[error("transport did not announce a local port within {0:?}")]
    TransportTimeout(Duration),

    /// The transport exited before announcing its local port
    #[error("transport exited: {0}")]
    TransportCrashed(String),

    /// The transport was stopped while waiting on it
    #[error("transport was stopped")]
    TransportStopped,

    /// Could not open the control channel
    #[error("control channel connection to {target} failed after {attempts} attempts: {reason}")]
    ChannelConnectFailed {
        target: String,
        attempts: u32,
        reason: String,
    },

    /// Interface parameters could not be applied
    #[error("interface configuration failed: {0}")]
    InterfaceConfigFailed(String),

    /// An interface script failed
    #[error("script error: {0}")]
    Script(String),

    /// The engine asked for input the controller cannot provide
    #[error("engine requires user input ({kind}): {prompt}")]
    UserInputRequired { kind: String, prompt: String },

    /// The engine reported a fatal condition
    #[error("engine failure: {0}")]
    EngineFailure(String),

    /// The control channel closed unexpectedly
    #[error("control channel closed")]
    ChannelClosed,

    /// The engine did not reach a connected state in time
    #[error("negotiation timed out after {0:?}")]
    NegotiationTimeout(Duration),

    /// No gateway matches the selection criteria
    #[error("no gateway available: {0}")]
    NoGatewayAvailable(String),

    /// Already running
    #[error("a tunnel attempt is already in progress")]
    AlreadyRunning,

    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Check if this is a recoverable error
    ///
    /// A recoverable failure is worth retrying, possibly with another gateway.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::TransportTimeout(_)
                | Error::TransportCrashed(_)
                | Error::ChannelConnectFailed { .. }
                | Error::ChannelClosed
                | Error::NegotiationTimeout(_)
        )
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_) | Error::GatewayParse(_))
    }

    /// Classify the error for a `Failed` state transition
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::TransportInstallFailed(_) => FailureKind::TransportInstall,
            Error::TransportTimeout(_) => FailureKind::TransportTimeout,
            Error::TransportCrashed(_) | Error::TransportStopped => FailureKind::TransportCrashed,
            Error::ChannelConnectFailed { .. } => FailureKind::ChannelConnect,
            Error::InterfaceConfigFailed(_) | Error::Tun(_) | Error::Script(_) => {
                FailureKind::InterfaceConfig
            }
            Error::UserInputRequired { .. } => FailureKind::UserInputRequired,
            Error::EngineFailure(_) => FailureKind::EngineFailure,
            Error::ChannelClosed => FailureKind::ChannelClosed,
            Error::NegotiationTimeout(_) => FailureKind::NegotiationTimeout,
            Error::NoGatewayAvailable(_) => FailureKind::NoGateway,
            _ => FailureKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::TransportTimeout(Duration::from_secs(5)).is_recoverable());
        assert!(Error::ChannelClosed.is_recoverable());
        assert!(!Error::TransportInstallFailed("missing".into()).is_recoverable());
        assert!(!Error::InterfaceConfigFailed("no tun".into()).is_recoverable());
        assert!(!Error::UserInputRequired {
            kind: "Auth".into(),
            prompt: "password".into()
        }
        .is_recoverable());
    }

    #[test]
    fn test_failure_kinds() {
        assert_eq!(
            Error::TransportTimeout(Duration::from_secs(5)).failure_kind(),
            FailureKind::TransportTimeout
        );
        assert_eq!(
            Error::Tun(hop_tun::Error::Setup("denied".into())).failure_kind(),
            FailureKind::InterfaceConfig
        );
        assert_eq!(Error::AlreadyRunning.failure_kind(), FailureKind::Other);
    }
}
