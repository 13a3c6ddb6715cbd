//! Script-backed interface configuration
//!
//! The host's tunnel interface is set up by user scripts: `on_up` runs when
//! the engine has negotiated the interface parameters, `on_down` when the
//! tunnel goes away.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use hop_tun::{InterfaceConfig, InterfaceConfigurator, TunnelInterface};
use tokio::process::Command;

use crate::error::{Error, Result};

/// Interface name used when neither the config nor the host picks one
pub const DEFAULT_INTERFACE_NAME: &str = "gatehop0";

/// How long a script may run unless configured otherwise
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters passed to interface scripts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptParams {
    /// Interface name
    pub interface: String,
    /// Session label, usually the gateway name
    pub session: String,
    /// Address in CIDR notation, e.g. `10.8.0.2/24`
    pub address: String,
    /// MTU, empty when the engine did not push one
    pub mtu: String,
    /// DNS servers, comma-separated, may be empty
    pub dns_servers: String,
    /// Routes in CIDR notation, comma-separated, may be empty
    pub routes: String,
    /// DNS search domain, may be empty
    pub search_domain: String,
}

impl ScriptParams {
    /// Build the script arguments for an interface
    pub fn new(interface: impl Into<String>, config: &InterfaceConfig) -> Self {
        Self {
            interface: interface.into(),
            session: config.session.clone(),
            address: config.ipv4.to_string(),
            mtu: config.mtu.map(|m| m.to_string()).unwrap_or_default(),
            dns_servers: config
                .dns
                .iter()
                .map(|ip| ip.to_string())
                .collect::<Vec<_>>()
                .join(","),
            routes: config
                .routes
                .iter()
                .map(|r| r.destination.to_string())
                .collect::<Vec<_>>()
                .join(","),
            search_domain: config.search_domain.clone().unwrap_or_default(),
        }
    }

    fn args(&self) -> [&str; 7] {
        [
            &self.interface,
            &self.session,
            &self.address,
            &self.mtu,
            &self.dns_servers,
            &self.routes,
            &self.search_domain,
        ]
    }
}

/// Run an interface script with the given parameters
///
/// The script receives arguments in the following order:
/// 1. Interface name
/// 2. Session label
/// 3. Address with prefix length
/// 4. MTU (may be empty)
/// 5. DNS servers (comma-separated, may be empty)
/// 6. Routes (comma-separated, may be empty)
/// 7. Search domain (may be empty)
///
/// On Unix the script is run through `/bin/sh -c` with the arguments as
/// positional parameters; on Windows through `cmd /C`. A script still
/// running after `timeout` is killed and reported as failed.
pub async fn run_script(script: &str, params: &ScriptParams, timeout: Duration) -> Result<()> {
    let args = params.args();

    log::info!("Running script: {} {}", script, args.join(" "));

    #[cfg(unix)]
    let mut command = {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(format!("{} \"$@\"", script))
            .arg("sh")
            .args(args);
        command
    };

    #[cfg(windows)]
    let mut command = {
        let quoted: Vec<String> = args.iter().map(|a| format!("\"{}\"", a)).collect();
        let mut command = Command::new("cmd");
        command.arg("/C").arg(format!("{} {}", script, quoted.join(" ")));
        command
    };

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(output) => output.map_err(|e| Error::Script(format!("failed to execute script: {}", e)))?,
        Err(_) => {
            log::error!("Script did not finish within {:?}, killed", timeout);
            return Err(Error::Script(format!("script timed out after {:?}", timeout)));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);

        let exit_code = output.status.code().unwrap_or(-1);

        log::error!(
            "Script failed with exit code {}: stdout={}, stderr={}",
            exit_code,
            stdout.trim(),
            stderr.trim()
        );

        return Err(Error::Script(format!(
            "script exited with code {}: {}",
            exit_code,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.is_empty() {
        log::debug!("Script output: {}", stdout.trim());
    }

    Ok(())
}

/// Sets the interface up and down with user scripts
#[derive(Debug, Clone)]
pub struct ScriptConfigurator {
    on_up: String,
    on_down: Option<String>,
    timeout: Duration,
}

impl ScriptConfigurator {
    pub fn new(on_up: impl Into<String>, on_down: Option<String>) -> Self {
        Self {
            on_up: on_up.into(),
            on_down,
            timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }

    /// Limit how long each script may run
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl InterfaceConfigurator for ScriptConfigurator {
    async fn establish(&self, config: &InterfaceConfig) -> hop_tun::Result<TunnelInterface> {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| DEFAULT_INTERFACE_NAME.to_string());
        let params = ScriptParams::new(&name, config);

        run_script(&self.on_up, &params, self.timeout)
            .await
            .map_err(|e| hop_tun::Error::Setup(e.to_string()))?;
        log::info!("on_up script completed successfully");

        Ok(TunnelInterface::new(Some(name), config.clone()))
    }

    /// Errors are reported but the interface is considered gone regardless
    async fn release(&self, interface: &TunnelInterface) -> hop_tun::Result<()> {
        let Some(ref script) = self.on_down else {
            return Ok(());
        };

        let params = ScriptParams::new(&interface.name, &interface.config);
        run_script(script, &params, self.timeout)
            .await
            .map_err(|e| hop_tun::Error::Teardown(e.to_string()))?;
        log::info!("on_down script completed successfully");
        Ok(())
    }
}

/// Accepts every configuration without touching the host
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConfigurator;

#[async_trait]
impl InterfaceConfigurator for NoopConfigurator {
    async fn establish(&self, config: &InterfaceConfig) -> hop_tun::Result<TunnelInterface> {
        log::info!(
            "Interface not configured (no on_up script): {} mtu={:?} dns={:?} routes={}",
            config.ipv4,
            config.mtu,
            config.dns,
            config.routes.len()
        );
        Ok(TunnelInterface::new(None, config.clone()))
    }

    async fn release(&self, _interface: &TunnelInterface) -> hop_tun::Result<()> {
        Ok(())
    }
}
