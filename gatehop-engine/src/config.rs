//! Configuration types for the tunnel engine

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gateway::{Gateway, GatewayScorer, SelectionCriteria, TimezoneScorer, TransportPreference, UniformScorer};

/// Main configuration structure
///
/// # Example Configuration
///
/// ```toml
/// [common]
/// log_level = "info"
///
/// [transport]
/// bin_dir = "/usr/lib/gatehop"
/// state_dir = "/var/lib/gatehop/state"
///
/// [channel]
/// connect_attempts = 8
///
/// [selection]
/// transport = "auto"
/// local_utc_offset = 1
///
/// [[gateways]]
/// host = "gw1.example.org"
/// ip_address = "192.0.2.10"
/// timezone = 1
///
/// [[gateways.transports]]
/// type = "obfs4"
/// ports = [23050]
/// cert = "..."
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Settings shared by every component
    #[serde(default)]
    pub common: CommonConfig,

    /// Obfuscation transport supervision
    #[serde(default)]
    pub transport: TransportConfig,

    /// Control channel to the tunnel engine
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Gateway selection
    #[serde(default)]
    pub selection: SelectionConfig,

    /// Tunnel interface
    #[serde(default)]
    pub interface: InterfaceSettings,

    /// Statically configured gateways
    #[serde(default)]
    pub gateways: Vec<Gateway>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        self.channel.validate()?;
        self.selection.validate()?;
        self.interface.validate()?;

        for gateway in &self.gateways {
            gateway.validate()?;
        }

        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# gatehop configuration

[common]
# Log level: "error", "warn", "info", "debug", "trace"
log_level = "info"

# Obfuscation transport (only started for gateways reached through obfs4)
[transport]
# Directory holding the transport binary. An architecture specific
# subdirectory (x86_64, x86, aarch64, arm) is preferred when present.
bin_dir = "/usr/lib/gatehop"

# Name of the transport binary
binary_name = "piedispatcher"

# Working directory handed to the transport; its log file is read from here
state_dir = "/var/lib/gatehop/state"

# Log file the transport writes inside state_dir
log_file = "dispatcher.log"

# Text marking the line that announces the local listener
announce_marker = "registered listener"

# How long to wait for the local port (milliseconds)
discovery_timeout_ms = 5000

# How often the log file is read (milliseconds)
poll_interval_ms = 250

# How long to wait for the transport to die after killing it (milliseconds)
kill_grace_ms = 1000

# Control channel to the tunnel engine
[channel]
# "tcp": dial the engine's management port
# "unix": connect to the engine's management socket and point it at the target
mode = "tcp"

# Management socket path, required for mode = "unix"
# management_socket = "/run/gatehop/mgmt.sock"

# Connection attempts before giving up, and the pause between them
connect_attempts = 8
retry_delay_ms = 300

# Give up if the engine is not connected after this many seconds
negotiation_timeout_secs = 60

# Traffic counter interval in seconds (0 disables)
bytecount_interval = 5

# How long to wait for the engine to close the channel on disconnect (milliseconds)
close_grace_ms = 2000

[selection]
# "auto" (direct when offered), "direct" or "obfs4"
transport = "auto"

# Number of closest gateways considered
closest = 3

# Only use gateways at this location
# location = "Amsterdam"

# Ranking: "timezone" or "uniform" (configuration order)
scorer = "timezone"

# Local UTC offset in hours, used by the timezone ranking
local_utc_offset = 0

# Dial an obfs4 gateway directly when its transport fails and it also
# offers a direct connection
fallback_to_direct = false

[interface]
# Interface name requested from the host (optional)
# name = "gatehop0"

# Script run when the tunnel is up
# Arguments: <interface> <session> <address/prefix> <mtu> <dns servers> <routes> <search domain>
# on_up = "/etc/gatehop/up.sh"

# Script run when the tunnel goes down, same arguments
# on_down = "/etc/gatehop/down.sh"

# Seconds a script may run before it is killed
script_timeout_secs = 30

[[gateways]]
host = "gw1.example.org"
ip_address = "192.0.2.10"
name = "gw1"
location = "Amsterdam"
timezone = 1

[[gateways.transports]]
type = "direct"
ports = [1194]

[[gateways.transports]]
type = "obfs4"
ports = [23050]
cert = "REPLACE-WITH-BRIDGE-CERT"
iat_mode = 0
"#
        .to_string()
    }
}

/// Settings shared by every component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Obfuscation transport supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Directory holding the transport binary
    #[serde(default = "default_bin_dir")]
    pub bin_dir: PathBuf,

    /// Name of the transport binary
    #[serde(default = "default_binary_name")]
    pub binary_name: String,

    /// Architecture subdirectory to use instead of the detected one
    #[serde(default)]
    pub arch: Option<String>,

    /// Working directory passed to the transport
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Log file written by the transport inside `state_dir`
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Transport name passed on the command line
    #[serde(default = "default_transport_name")]
    pub transport_name: String,

    /// Log level passed on the command line
    #[serde(default = "default_transport_log_level")]
    pub log_level: String,

    /// Text marking the listener announcement
    #[serde(default = "default_announce_marker")]
    pub announce_marker: String,

    /// Deadline for the local port to be announced, in milliseconds
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,

    /// Log file polling interval, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Deadline for a single log file read, in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Wait for the process to exit after a kill, in milliseconds
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bin_dir: default_bin_dir(),
            binary_name: default_binary_name(),
            arch: None,
            state_dir: default_state_dir(),
            log_file: default_log_file(),
            transport_name: default_transport_name(),
            log_level: default_transport_log_level(),
            announce_marker: default_announce_marker(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Result<()> {
        if self.binary_name.is_empty() || self.binary_name.contains(['/', '\\']) {
            return Err(Error::Config(format!(
                "invalid transport binary_name '{}'",
                self.binary_name
            )));
        }
        if self.log_file.is_empty() {
            return Err(Error::Config("transport log_file must not be empty".into()));
        }
        if self.announce_marker.is_empty() {
            return Err(Error::Config("transport announce_marker must not be empty".into()));
        }
        if self.discovery_timeout_ms == 0 {
            return Err(Error::Config("discovery_timeout_ms must be greater than 0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be greater than 0".into()));
        }
        Ok(())
    }

    /// Deadline for the local port to be announced
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Log file polling interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Deadline for a single log file read
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    /// Wait for the process to exit after a kill
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Full path of the transport's log file
    pub fn log_path(&self) -> PathBuf {
        self.state_dir.join(&self.log_file)
    }
}

/// How the control channel is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    /// Dial the target address over TCP
    #[default]
    Tcp,
    /// Connect to a local management socket
    Unix,
}

/// Control channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// How the channel is reached
    #[serde(default)]
    pub mode: ChannelMode,

    /// Management socket path for [`ChannelMode::Unix`]
    #[serde(default)]
    pub management_socket: Option<PathBuf>,

    /// Connection attempts before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Pause between connection attempts, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Deadline for the engine to connect, in seconds
    #[serde(default = "default_negotiation_timeout_secs")]
    pub negotiation_timeout_secs: u64,

    /// Traffic counter interval in seconds (0 disables)
    #[serde(default = "default_bytecount_interval")]
    pub bytecount_interval: u32,

    /// Wait for the engine to close the channel on disconnect, in milliseconds
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mode: ChannelMode::default(),
            management_socket: None,
            connect_attempts: default_connect_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            negotiation_timeout_secs: default_negotiation_timeout_secs(),
            bytecount_interval: default_bytecount_interval(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

impl ChannelConfig {
    /// Validate channel configuration
    pub fn validate(&self) -> Result<()> {
        if self.connect_attempts == 0 {
            return Err(Error::Config("connect_attempts must be at least 1".into()));
        }
        if self.negotiation_timeout_secs == 0 {
            return Err(Error::Config("negotiation_timeout_secs must be greater than 0".into()));
        }
        if self.mode == ChannelMode::Unix && self.management_socket.is_none() {
            return Err(Error::Config(
                "management_socket is required when channel mode is \"unix\"".into(),
            ));
        }
        Ok(())
    }

    /// Pause between connection attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Deadline for the engine to connect
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    /// Wait for the engine to close the channel on disconnect
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Gateway ranking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScorerKind {
    /// Closest timezone first
    #[default]
    Timezone,
    /// Configuration order
    Uniform,
}

/// Gateway selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Transport preference
    #[serde(default)]
    pub transport: TransportPreference,

    /// Number of closest gateways considered
    #[serde(default = "default_closest")]
    pub closest: usize,

    /// Only use gateways at this location
    #[serde(default)]
    pub location: Option<String>,

    /// Ranking used
    #[serde(default)]
    pub scorer: ScorerKind,

    /// Local UTC offset in hours
    #[serde(default)]
    pub local_utc_offset: i32,

    /// Dial an obfs4 gateway directly if its transport fails
    #[serde(default)]
    pub fallback_to_direct: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            transport: TransportPreference::default(),
            closest: default_closest(),
            location: None,
            scorer: ScorerKind::default(),
            local_utc_offset: 0,
            fallback_to_direct: false,
        }
    }
}

impl SelectionConfig {
    /// Validate selection configuration
    pub fn validate(&self) -> Result<()> {
        if self.closest == 0 {
            return Err(Error::Config("closest must be at least 1".into()));
        }
        if !(-12..=14).contains(&self.local_utc_offset) {
            return Err(Error::Config(format!(
                "local_utc_offset {} out of range",
                self.local_utc_offset
            )));
        }
        Ok(())
    }

    /// Criteria for the catalog
    pub fn criteria(&self) -> SelectionCriteria {
        SelectionCriteria {
            closest: self.closest,
            transport: self.transport,
            location: self.location.clone(),
        }
    }

    /// Scorer for the catalog
    pub fn scorer(&self) -> Arc<dyn GatewayScorer> {
        match self.scorer {
            ScorerKind::Timezone => Arc::new(TimezoneScorer::new(self.local_utc_offset)),
            ScorerKind::Uniform => Arc::new(UniformScorer),
        }
    }
}

/// Tunnel interface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSettings {
    /// Interface name requested from the host
    #[serde(default)]
    pub name: Option<String>,

    /// Script run when the tunnel is up
    #[serde(default)]
    pub on_up: Option<String>,

    /// Script run when the tunnel goes down
    #[serde(default)]
    pub on_down: Option<String>,

    /// Seconds a script may run before it is killed
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            name: None,
            on_up: None,
            on_down: None,
            script_timeout_secs: default_script_timeout_secs(),
        }
    }
}

impl InterfaceSettings {
    pub fn validate(&self) -> Result<()> {
        if self.script_timeout_secs == 0 {
            return Err(Error::Config("script_timeout_secs must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bin_dir() -> PathBuf {
    PathBuf::from("/usr/lib/gatehop")
}

fn default_binary_name() -> String {
    "piedispatcher".to_string()
}

fn default_state_dir() -> PathBuf {
    std::env::temp_dir().join("gatehop").join("state")
}

fn default_log_file() -> String {
    "dispatcher.log".to_string()
}

fn default_transport_name() -> String {
    "obfs4".to_string()
}

fn default_transport_log_level() -> String {
    "DEBUG".to_string()
}

fn default_announce_marker() -> String {
    "registered listener".to_string()
}

fn default_discovery_timeout_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_kill_grace_ms() -> u64 {
    1000
}

fn default_connect_attempts() -> u32 {
    8
}

fn default_retry_delay_ms() -> u64 {
    300
}

fn default_negotiation_timeout_secs() -> u64 {
    60
}

fn default_bytecount_interval() -> u32 {
    5
}

fn default_close_grace_ms() -> u64 {
    2000
}

fn default_closest() -> usize {
    3
}

fn default_script_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.common.log_level, "info");
        assert_eq!(config.transport.discovery_timeout(), Duration::from_secs(5));
        assert_eq!(config.transport.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.transport.binary_name, "piedispatcher");
        assert_eq!(config.channel.connect_attempts, 8);
        assert_eq!(config.channel.retry_delay(), Duration::from_millis(300));
        assert_eq!(config.selection.transport, TransportPreference::Auto);
        assert!(!config.selection.fallback_to_direct);
        assert_eq!(config.interface.script_timeout(), Duration::from_secs(30));
        assert!(config.gateways.is_empty());
    }

    #[test]
    fn test_sample_config_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        assert_eq!(config.gateways.len(), 1);

        let gw = &config.gateways[0];
        assert!(gw.supports_direct());
        assert!(gw.supports_obfs4());
        assert_eq!(config.selection.closest, 3);
        assert_eq!(config.transport.log_path().file_name().unwrap(), "dispatcher.log");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[transport]
bin_dir = "/opt/gatehop/bin"
arch = "arm"
discovery_timeout_ms = 2000

[channel]
mode = "unix"
management_socket = "/run/gatehop.sock"
connect_attempts = 3

[selection]
transport = "obfs4"
scorer = "uniform"
location = "Paris"

[interface]
on_up = "/etc/gatehop/up.sh"

[[gateways]]
host = "gw2.example.org"
ip_address = "198.51.100.4"

[[gateways.transports]]
type = "obfs4"
ports = [443]
cert = "abc"
iat_mode = 2
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.transport.arch.as_deref(), Some("arm"));
        assert_eq!(config.transport.discovery_timeout(), Duration::from_secs(2));
        assert_eq!(config.channel.mode, ChannelMode::Unix);
        assert_eq!(config.selection.scorer, ScorerKind::Uniform);
        assert_eq!(config.selection.criteria().transport, TransportPreference::Obfs4);
        assert_eq!(config.interface.on_up.as_deref(), Some("/etc/gatehop/up.sh"));
        assert_eq!(config.gateways[0].obfs4().unwrap().1.iat_mode, 2);
    }

    #[test]
    fn test_unix_mode_requires_socket() {
        let result = Config::from_toml("[channel]\nmode = \"unix\"\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        assert!(Config::from_toml("[transport]\ndiscovery_timeout_ms = 0\n").is_err());
        assert!(Config::from_toml("[channel]\nconnect_attempts = 0\n").is_err());
        assert!(Config::from_toml("[interface]\nscript_timeout_secs = 0\n").is_err());
    }

    #[test]
    fn test_gateway_without_transports_rejected() {
        let toml = r#"
[[gateways]]
host = "gw.example.org"
ip_address = "192.0.2.1"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_invalid_toml() {
        let result = Config::from_toml("[transport\n");
        assert!(matches!(result, Err(Error::ConfigParse(_))));
    }
}
