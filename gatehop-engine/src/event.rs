//! Tunnel events and connection state

use hop_mgmt::LogLevel;
use hop_tun::Ipv4Config;

/// Tunnel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No attempt in progress
    Idle,
    /// Waiting for the obfuscation transport to announce its local port
    AwaitingTransport,
    /// Opening the engine's control channel
    ChannelConnecting,
    /// Engine is negotiating the tunnel
    Negotiating,
    /// Tunnel and interface are up
    Connected,
    /// Shutting the tunnel down on request
    Disconnecting,
    /// The attempt failed; resources are already released
    Failed,
}

impl ConnectionState {
    /// Check if an attempt is in progress
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::AwaitingTransport
                | ConnectionState::ChannelConnecting
                | ConnectionState::Negotiating
                | ConnectionState::Connected
                | ConnectionState::Disconnecting
        )
    }

    /// Check if the tunnel is up
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if no further transition happens without caller action
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ConnectionState::Idle | ConnectionState::Connected | ConnectionState::Failed
        )
    }

    /// Check whether `next` is a legal successor of this state
    ///
    /// Aborting is legal from every state.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if next == Idle {
            return true;
        }

        match self {
            Idle => matches!(next, AwaitingTransport | ChannelConnecting),
            AwaitingTransport => matches!(next, ChannelConnecting | Failed),
            ChannelConnecting => matches!(next, Negotiating | Failed),
            Negotiating => matches!(next, Connected | Failed),
            Connected => matches!(next, Disconnecting | Failed),
            Disconnecting => false,
            Failed => false,
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::AwaitingTransport => "Starting transport...",
            ConnectionState::ChannelConnecting => "Connecting...",
            ConnectionState::Negotiating => "Negotiating...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting...",
            ConnectionState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Why an attempt ended in [`ConnectionState::Failed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    TransportInstall,
    TransportTimeout,
    TransportCrashed,
    ChannelConnect,
    InterfaceConfig,
    UserInputRequired,
    EngineFailure,
    ChannelClosed,
    NegotiationTimeout,
    NoGateway,
    Other,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::TransportInstall => "transport unavailable",
            FailureKind::TransportTimeout => "transport timeout",
            FailureKind::TransportCrashed => "transport crashed",
            FailureKind::ChannelConnect => "control channel unreachable",
            FailureKind::InterfaceConfig => "interface configuration failed",
            FailureKind::UserInputRequired => "user input required",
            FailureKind::EngineFailure => "engine failure",
            FailureKind::ChannelClosed => "control channel closed",
            FailureKind::NegotiationTimeout => "negotiation timeout",
            FailureKind::NoGateway => "no gateway available",
            FailureKind::Other => "error",
        };
        f.write_str(s)
    }
}

/// Events emitted by the tunnel controller
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelEvent {
    /// State changed
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
        /// What caused the transition
        detail: String,
        /// Set when `new` is [`ConnectionState::Failed`]
        failure: Option<FailureKind>,
    },

    /// Traffic counters reported by the engine
    Traffic { bytes_in: u64, bytes_out: u64 },

    /// The engine waits for input only the user can give
    UserInputRequired { kind: String, prompt: String },

    /// The tunnel interface was created
    InterfaceUp { name: String, address: Ipv4Config },

    /// Log line forwarded from the engine
    EngineLog { level: LogLevel, message: String },
}

impl TunnelEvent {
    /// Write the event to the log
    pub fn log(&self) {
        match self {
            TunnelEvent::StateChanged {
                old,
                new,
                detail,
                failure,
            } => match failure {
                Some(kind) => log::error!("Tunnel state: {} -> {} ({}: {})", old, new, kind, detail),
                None if detail.is_empty() => log::info!("Tunnel state: {} -> {}", old, new),
                None => log::info!("Tunnel state: {} -> {} ({})", old, new, detail),
            },
            TunnelEvent::Traffic {
                bytes_in,
                bytes_out,
            } => {
                log::debug!("Traffic: in={} out={}", bytes_in, bytes_out);
            }
            TunnelEvent::UserInputRequired { kind, prompt } => {
                log::warn!("Engine requires user input ({}): {}", kind, prompt);
            }
            TunnelEvent::InterfaceUp { name, address } => {
                log::info!("Interface {} up with {}", name, address);
            }
            TunnelEvent::EngineLog { level, message } => match level {
                LogLevel::Debug => log::debug!("engine: {}", message),
                LogLevel::Info => log::info!("engine: {}", message),
                LogLevel::Warning => log::warn!("engine: {}", message),
                LogLevel::Error | LogLevel::Fatal => log::error!("engine: {}", message),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    const ALL: [ConnectionState; 7] = [
        Idle,
        AwaitingTransport,
        ChannelConnecting,
        Negotiating,
        Connected,
        Disconnecting,
        Failed,
    ];

    #[test]
    fn test_idle_never_jumps_to_connected() {
        assert!(!Idle.can_transition_to(Connected));
        assert!(!Idle.can_transition_to(Negotiating));
        assert!(Idle.can_transition_to(AwaitingTransport));
        assert!(Idle.can_transition_to(ChannelConnecting));
    }

    #[test]
    fn test_abort_is_legal_everywhere() {
        for state in ALL {
            assert!(state.can_transition_to(Idle), "{:?} -> Idle", state);
        }
    }

    #[test]
    fn test_failed_only_leaves_to_idle() {
        for state in ALL {
            assert_eq!(Failed.can_transition_to(state), state == Idle, "{:?}", state);
        }
    }

    #[test]
    fn test_disconnecting_only_ends_idle() {
        for state in ALL {
            assert_eq!(Disconnecting.can_transition_to(state), state == Idle, "{:?}", state);
        }
    }

    #[test]
    fn test_obfuscated_path() {
        assert!(AwaitingTransport.can_transition_to(ChannelConnecting));
        assert!(AwaitingTransport.can_transition_to(Failed));
        assert!(!AwaitingTransport.can_transition_to(Negotiating));
    }

    #[test]
    fn test_settled_states() {
        let settled: Vec<_> = ALL.iter().filter(|s| s.is_settled()).collect();
        assert_eq!(settled, vec![&Idle, &Connected, &Failed]);
        assert!(!Idle.is_active());
        assert!(!Failed.is_active());
        assert!(Negotiating.is_active());
    }
}
