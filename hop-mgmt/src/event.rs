//! Event decoding
//!
//! Each line received from the engine decodes to exactly one [`Event`].
//! Decoding is total: lines the decoder does not understand, including
//! malformed variants of known messages, become [`Event::Raw`] so that a
//! newer engine never aborts the session.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::REALTIME_PREFIX;

/// Coarse connection level derived from the engine's state name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLevel {
    /// Any of the intermediate connecting states
    Connecting,
    /// Tunnel is up
    Connected,
    /// Engine lost the connection and is trying again on its own
    Reconnecting,
    /// No usable network
    NoNetwork,
    /// Credentials were rejected
    AuthFailed,
    /// Engine is shutting down
    Exiting,
    /// State name not known to this decoder
    Other,
}

impl ConnectionLevel {
    /// Map an engine state name (e.g. `CONNECTED`) to a level
    pub fn from_state_name(name: &str) -> Self {
        match name {
            "CONNECTING" | "WAIT" | "AUTH" | "AUTH_PENDING" | "GET_CONFIG" | "ASSIGN_IP"
            | "ADD_ROUTES" | "RESOLVE" | "TCP_CONNECT" => ConnectionLevel::Connecting,
            "CONNECTED" => ConnectionLevel::Connected,
            "RECONNECTING" => ConnectionLevel::Reconnecting,
            "NONETWORK" => ConnectionLevel::NoNetwork,
            "AUTH_FAILED" => ConnectionLevel::AuthFailed,
            "EXITING" => ConnectionLevel::Exiting,
            _ => ConnectionLevel::Other,
        }
    }

    /// Level reports that the tunnel cannot continue
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ConnectionLevel::NoNetwork | ConnectionLevel::AuthFailed | ConnectionLevel::Exiting
        )
    }
}

impl fmt::Display for ConnectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionLevel::Connecting => "connecting",
            ConnectionLevel::Connected => "connected",
            ConnectionLevel::Reconnecting => "reconnecting",
            ConnectionLevel::NoNetwork => "no network",
            ConnectionLevel::AuthFailed => "authentication failed",
            ConnectionLevel::Exiting => "exiting",
            ConnectionLevel::Other => "other",
        };
        f.write_str(s)
    }
}

/// Severity of an engine log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    fn from_flags(flags: &str) -> Self {
        if flags.contains('F') {
            LogLevel::Fatal
        } else if flags.contains('N') {
            LogLevel::Error
        } else if flags.contains('W') {
            LogLevel::Warning
        } else if flags.contains('D') {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Fatal => write!(f, "FATAL"),
        }
    }
}

/// A `>STATE:` notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Unix timestamp reported by the engine
    pub timestamp: Option<u64>,
    /// Raw state name, e.g. `GET_CONFIG`
    pub state: String,
    /// Level derived from the state name
    pub level: ConnectionLevel,
    /// Human-readable detail
    pub detail: String,
    /// Local tunnel address, when the engine reports one
    pub local_ip: Option<IpAddr>,
    /// Remote peer address, when the engine reports one
    pub remote_ip: Option<IpAddr>,
}

/// Interface parameter pushed by the engine for confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceParam {
    /// Local address with netmask and optional MTU
    Address {
        ip: Ipv4Addr,
        netmask: Ipv4Addr,
        mtu: Option<u16>,
    },
    /// Route to be sent through the tunnel
    Route { network: Ipv4Addr, netmask: Ipv4Addr },
    /// DNS server to use while connected
    DnsServer(IpAddr),
    /// DNS search domain
    SearchDomain(String),
    /// Engine is ready for the interface to be opened
    OpenTun,
}

impl InterfaceParam {
    /// Request kind used on the wire and in the `needok` answer
    pub fn kind(&self) -> &'static str {
        match self {
            InterfaceParam::Address { .. } => "IFCONFIG",
            InterfaceParam::Route { .. } => "ROUTE",
            InterfaceParam::DnsServer(_) => "DNSSERVER",
            InterfaceParam::SearchDomain(_) => "DNSDOMAIN",
            InterfaceParam::OpenTun => "OPENTUN",
        }
    }
}

/// A decoded line from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Connection state changed
    Status(StatusUpdate),
    /// Traffic counters
    ByteCount { bytes_in: u64, bytes_out: u64 },
    /// Engine log line
    Log { level: LogLevel, message: String },
    /// Engine waits for credentials or a confirmation from the user
    NeedsUserInput { kind: String, prompt: String },
    /// Interface parameter to apply, answered with `needok <kind> ok`
    InterfaceParam(InterfaceParam),
    /// Engine is held until `hold release`
    Hold { message: String },
    /// Reply to a command
    Reply { ok: bool, message: String },
    /// Anything else
    Raw(String),
}

/// Decode one line (terminator optional) into an [`Event`]
pub fn decode_line(line: &str) -> Event {
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(message) = line.strip_prefix("SUCCESS:") {
        return Event::Reply {
            ok: true,
            message: message.trim().to_string(),
        };
    }
    if let Some(message) = line.strip_prefix("ERROR:") {
        return Event::Reply {
            ok: false,
            message: message.trim().to_string(),
        };
    }

    let Some(body) = line.strip_prefix(REALTIME_PREFIX) else {
        return Event::Raw(line.to_string());
    };
    let Some((kind, payload)) = body.split_once(':') else {
        return Event::Raw(line.to_string());
    };

    let decoded = match kind {
        "STATE" => decode_state(payload),
        "BYTECOUNT" => decode_bytecount(payload),
        "LOG" => decode_log(payload),
        "INFO" => Some(Event::Log {
            level: LogLevel::Info,
            message: payload.to_string(),
        }),
        "FATAL" => Some(Event::Log {
            level: LogLevel::Fatal,
            message: payload.to_string(),
        }),
        "HOLD" => Some(Event::Hold {
            message: payload.to_string(),
        }),
        "PASSWORD" => decode_password(payload),
        "NEED-OK" => decode_need_ok(payload),
        "NEED-STR" => decode_need_str(payload),
        _ => return Event::Raw(line.to_string()),
    };

    decoded.unwrap_or_else(|| {
        log::warn!("Malformed {} message from engine: {}", kind, line);
        Event::Raw(line.to_string())
    })
}

fn decode_state(payload: &str) -> Option<Event> {
    let fields: Vec<&str> = payload.split(',').collect();
    let state = fields.get(1).map(|s| s.trim()).filter(|s| !s.is_empty())?;

    Some(Event::Status(StatusUpdate {
        timestamp: fields.first().and_then(|s| s.trim().parse().ok()),
        state: state.to_string(),
        level: ConnectionLevel::from_state_name(state),
        detail: fields.get(2).map(|s| s.trim().to_string()).unwrap_or_default(),
        local_ip: fields.get(3).and_then(|s| s.trim().parse().ok()),
        remote_ip: fields.get(4).and_then(|s| s.trim().parse().ok()),
    }))
}

fn decode_bytecount(payload: &str) -> Option<Event> {
    let (bytes_in, bytes_out) = payload.split_once(',')?;
    Some(Event::ByteCount {
        bytes_in: bytes_in.trim().parse().ok()?,
        bytes_out: bytes_out.trim().parse().ok()?,
    })
}

fn decode_log(payload: &str) -> Option<Event> {
    let mut fields = payload.splitn(3, ',');
    let _timestamp = fields.next()?;
    let flags = fields.next()?;
    let message = fields.next()?;
    Some(Event::Log {
        level: LogLevel::from_flags(flags),
        message: message.to_string(),
    })
}

fn decode_password(payload: &str) -> Option<Event> {
    if payload.starts_with("Verification Failed") {
        return Some(Event::Status(StatusUpdate {
            timestamp: None,
            state: "AUTH_FAILED".into(),
            level: ConnectionLevel::AuthFailed,
            detail: payload.trim().to_string(),
            local_ip: None,
            remote_ip: None,
        }));
    }

    let kind = quoted_kind(payload)?;
    Some(Event::NeedsUserInput {
        kind: kind.to_string(),
        prompt: payload.trim().to_string(),
    })
}

fn decode_need_str(payload: &str) -> Option<Event> {
    let kind = quoted_kind(payload)?;
    Some(Event::NeedsUserInput {
        kind: kind.to_string(),
        prompt: message_part(payload).unwrap_or(payload).trim().to_string(),
    })
}

fn decode_need_ok(payload: &str) -> Option<Event> {
    let kind = quoted_kind(payload)?;
    let msg = message_part(payload).unwrap_or("").trim();
    let mut parts = msg.split_whitespace();

    let param = match kind {
        "IFCONFIG" => InterfaceParam::Address {
            ip: parts.next()?.parse().ok()?,
            netmask: parts.next()?.parse().ok()?,
            mtu: match parts.next() {
                Some(mtu) => Some(mtu.parse().ok()?),
                None => None,
            },
        },
        "ROUTE" => InterfaceParam::Route {
            network: parts.next()?.parse().ok()?,
            netmask: parts.next()?.parse().ok()?,
        },
        "DNSSERVER" => InterfaceParam::DnsServer(parts.next()?.parse().ok()?),
        "DNSDOMAIN" => InterfaceParam::SearchDomain(parts.next()?.to_string()),
        "OPENTUN" => InterfaceParam::OpenTun,
        _ => {
            return Some(Event::NeedsUserInput {
                kind: kind.to_string(),
                prompt: if msg.is_empty() { payload.trim() } else { msg }.to_string(),
            })
        }
    };

    Some(Event::InterfaceParam(param))
}

/// Text between the first pair of single quotes
fn quoted_kind(payload: &str) -> Option<&str> {
    let start = payload.find('\'')? + 1;
    let len = payload[start..].find('\'')?;
    let kind = &payload[start..start + len];
    if kind.is_empty() {
        None
    } else {
        Some(kind)
    }
}

/// Text after `MSG:`
fn message_part(payload: &str) -> Option<&str> {
    payload.find("MSG:").map(|idx| &payload[idx + 4..])
}
