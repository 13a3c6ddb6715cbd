//! Command encoding
//!
//! Every command is one line: the command name followed by space separated
//! arguments and a single `\n`. Arguments that are empty or contain
//! whitespace, quotes or backslashes are double-quoted with backslash
//! escaping.

use std::fmt;

use crate::error::{Error, Result};

/// Signals understood by the engine's `signal` command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Terminate the tunnel and exit
    Sigint,
    /// Terminate the tunnel and exit
    Sigterm,
    /// Restart the tunnel
    Sighup,
    /// Soft restart (reconnect without re-reading configuration)
    Sigusr1,
    /// Dump connection statistics to the log
    Sigusr2,
}

impl Signal {
    /// Wire name of the signal
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Sigint => "SIGINT",
            Signal::Sigterm => "SIGTERM",
            Signal::Sighup => "SIGHUP",
            Signal::Sigusr1 => "SIGUSR1",
            Signal::Sigusr2 => "SIGUSR2",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A management command ready to be encoded
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<String>,
    /// Arguments are redacted in `Debug`/`Display` output
    sensitive: bool,
}

impl Command {
    /// Create a command with no arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            sensitive: false,
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Command name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Command arguments
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// `signal <SIG>`
    pub fn signal(signal: Signal) -> Self {
        Self::new("signal").arg(signal.as_str())
    }

    /// `hold release`: let an engine started with a management hold proceed
    pub fn hold_release() -> Self {
        Self::new("hold").arg("release")
    }

    /// `state on`: enable real-time state notifications
    pub fn state_on() -> Self {
        Self::new("state").arg("on")
    }

    /// `log on`: enable real-time log forwarding
    pub fn log_on() -> Self {
        Self::new("log").arg("on")
    }

    /// `bytecount <secs>`: traffic counters every `secs` seconds (0 disables)
    pub fn bytecount(interval_secs: u32) -> Self {
        Self::new("bytecount").arg(interval_secs.to_string())
    }

    /// `needok <kind> ok|cancel`: answer a `>NEED-OK` request
    pub fn needok(kind: &str, ok: bool) -> Self {
        Self::new("needok")
            .arg(kind)
            .arg(if ok { "ok" } else { "cancel" })
    }

    /// `remote MOD <host> <port>`: point the engine at a different remote
    pub fn remote_modify(host: &str, port: u16) -> Self {
        Self::new("remote")
            .arg("MOD")
            .arg(host)
            .arg(port.to_string())
    }

    /// `username <kind> <value>`
    pub fn username(kind: &str, username: &str) -> Self {
        let mut cmd = Self::new("username").arg(kind).arg(username);
        cmd.sensitive = true;
        cmd
    }

    /// `password <kind> <value>`
    pub fn password(kind: &str, password: &str) -> Self {
        let mut cmd = Self::new("password").arg(kind).arg(password);
        cmd.sensitive = true;
        cmd
    }

    /// Serialize to a single newline-terminated line
    pub fn encode(&self) -> Result<Vec<u8>> {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        encode_command(&self.name, &args)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.sensitive {
            // keep the kind, hide the secret
            if let Some(kind) = self.args.first() {
                write!(f, " {}", quote(kind))?;
            }
            return f.write_str(" [redacted]");
        }
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({})", self)
    }
}

/// Serialize a command name and its arguments as one `\n`-terminated line
///
/// Line terminators are rejected anywhere in the input since they would
/// split the command on the wire.
pub fn encode_command(name: &str, args: &[&str]) -> Result<Vec<u8>> {
    if name.is_empty() {
        return Err(Error::InvalidCommand("empty command name".into()));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        return Err(Error::InvalidCommand(format!(
            "command name '{}' contains whitespace or quoting characters",
            name.escape_debug()
        )));
    }

    let mut line = String::with_capacity(name.len() + 1 + args.iter().map(|a| a.len() + 3).sum::<usize>());
    line.push_str(name);

    for (index, arg) in args.iter().enumerate() {
        if arg.contains(['\n', '\r']) {
            return Err(Error::InvalidArgument {
                command: name.to_string(),
                index,
                reason: "contains a line terminator".into(),
            });
        }
        line.push(' ');
        line.push_str(&quote(arg));
    }

    line.push('\n');
    Ok(line.into_bytes())
}

fn needs_quoting(arg: &str) -> bool {
    arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\')
}

fn quote(arg: &str) -> String {
    if !needs_quoting(arg) {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
