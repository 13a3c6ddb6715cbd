//! Obfuscation transport supervision
//!
//! The transport is an external program that listens on a local port and
//! forwards everything to the gateway's obfs4 bridge. It only tells us which
//! port it picked through its log output, so the supervisor watches both its
//! stdio and the log file it writes into the state directory until an
//! announcement shows up.
//!
//! Each [`TransportProcess`] owns its child and a supervision task. Stopping
//! or dropping it kills the child through that handle.

mod binary;
mod discovery;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use hop_mgmt::LineFramer;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::TransportConfig;
use crate::error::{Error, Result};

pub use binary::{current_arch, resolve_binary};
pub use discovery::PortDiscovery;

/// Connection parameters for an obfs4 bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obfs4Params {
    /// Bridge certificate
    pub cert: String,
    /// Inter-arrival time mode
    pub iat_mode: u8,
}

impl Obfs4Params {
    /// The `-options` argument handed to the transport
    pub fn options_json(&self) -> String {
        serde_json::json!({
            "cert": self.cert,
            "iatMode": self.iat_mode.to_string(),
        })
        .to_string()
    }
}

/// How a transport process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportExit {
    /// Exited on its own
    Crashed(String),
    /// Stopped by us
    Stopped,
}

#[derive(Debug, Clone, Default)]
struct Status {
    /// Written once
    port: Option<u16>,
    exit: Option<TransportExit>,
}

/// Starts transport processes
#[derive(Debug, Clone)]
pub struct TransportSupervisor {
    config: TransportConfig,
}

impl TransportSupervisor {
    /// Create a supervisor
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Supervisor settings
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Find the transport binary for this machine
    pub fn resolve_binary(&self) -> Result<PathBuf> {
        resolve_binary(
            &self.config.bin_dir,
            &self.config.binary_name,
            self.config.arch.as_deref(),
        )
    }

    /// Launch a transport forwarding to `remote_host:remote_port`
    ///
    /// Returns as soon as the process is spawned; use
    /// [`TransportProcess::await_local_port`] to wait for it to listen.
    pub async fn start(&self, remote_host: &str, remote_port: u16, params: &Obfs4Params) -> Result<TransportProcess> {
        let binary = self.resolve_binary()?;
        let state_dir = &self.config.state_dir;

        tokio::fs::create_dir_all(state_dir).await?;

        // a stale announcement from a previous run must not be picked up
        let log_path = self.config.log_path();
        match tokio::fs::remove_file(&log_path).await {
            Ok(()) => log::debug!("Removed old transport log {}", log_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let target = format_target(remote_host, remote_port);

        log::info!(
            "Starting {} transport {} -> {}",
            self.config.transport_name,
            binary.display(),
            target
        );

        let mut child = Command::new(&binary)
            .arg("-transparent")
            .arg("-client")
            .arg("-state")
            .arg(state_dir)
            .arg("-target")
            .arg(&target)
            .arg("-transports")
            .arg(&self.config.transport_name)
            .arg("-options")
            .arg(params.options_json())
            .arg("-logLevel")
            .arg(&self.config.log_level)
            .arg("-enableLogging")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::TransportInstallFailed(format!("failed to execute {}: {}", binary.display(), e)))?;

        let pid = child.id();
        log::debug!("Transport running with pid {:?}", pid);

        let status = Arc::new(watch::Sender::new(Status::default()));
        let (stop_tx, stop_rx) = oneshot::channel();

        let supervision = Supervision {
            stdout: child.stdout.take().map(OutputPipe::new),
            stderr: child.stderr.take().map(OutputPipe::new),
            child,
            log_path,
            log_offset: 0,
            log_framer: LineFramer::new(),
            discovery: PortDiscovery::new(self.config.announce_marker.clone()),
            poll_interval: self.config.poll_interval(),
            read_timeout: self.config.read_timeout(),
            kill_grace: self.config.kill_grace(),
            status: status.clone(),
        };
        let task = tokio::spawn(supervision.run(stop_rx));

        Ok(TransportProcess {
            binary,
            pid,
            status,
            stop_tx: Mutex::new(Some(stop_tx)),
            task: Mutex::new(Some(task)),
            kill_grace: self.config.kill_grace(),
        })
    }
}

fn format_target(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// A running transport process
#[derive(Debug)]
pub struct TransportProcess {
    binary: PathBuf,
    pid: Option<u32>,
    status: Arc<watch::Sender<Status>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    kill_grace: Duration,
}

impl TransportProcess {
    /// Path of the running binary
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Process id captured at spawn
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Check if the process is still alive
    pub fn is_running(&self) -> bool {
        self.status.borrow().exit.is_none()
    }

    /// The announced local port, once known
    pub fn local_port(&self) -> Option<u16> {
        self.status.borrow().port
    }

    /// Local address to dial once the port is known
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_port().map(|port| SocketAddr::from(([127, 0, 0, 1], port)))
    }

    /// Wait for the transport to announce its local port
    pub async fn await_local_port(&self, timeout: Duration) -> Result<u16> {
        let mut rx = self.status.subscribe();

        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.port.is_some() || s.exit.is_some())
                .await
                .map(|s| (s.port, s.exit.clone()))
        })
        .await;

        match waited {
            Err(_) => Err(Error::TransportTimeout(timeout)),
            Ok(Err(_)) => Err(Error::TransportStopped),
            Ok(Ok((Some(port), _))) => Ok(port),
            Ok(Ok((None, Some(TransportExit::Crashed(reason))))) => Err(Error::TransportCrashed(reason)),
            Ok(Ok((None, _))) => Err(Error::TransportStopped),
        }
    }

    /// Wait until the process has ended
    pub async fn exited(&self) -> TransportExit {
        let mut rx = self.status.subscribe();
        let exit = match rx.wait_for(|s| s.exit.is_some()).await {
            Ok(s) => s.exit.clone(),
            Err(_) => None,
        };
        exit.unwrap_or(TransportExit::Stopped)
    }

    /// Kill the process and wait for its supervision task
    ///
    /// Calling it again, or after the process died, does nothing.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().await.take() {
            let _ = tx.send(());
        }

        let task = self.task.lock().await.take();
        if let Some(mut task) = task {
            let deadline = self.kill_grace + Duration::from_millis(500);
            if tokio::time::timeout(deadline, &mut task).await.is_err() {
                log::warn!("Transport supervision did not finish in {:?}, aborting it", deadline);
                task.abort();
            }
        }

        self.status.send_modify(|s| {
            if s.exit.is_none() {
                s.exit = Some(TransportExit::Stopped);
            }
        });
    }
}

/// State owned by the supervision task
struct Supervision {
    child: Child,
    stdout: Option<OutputPipe<tokio::process::ChildStdout>>,
    stderr: Option<OutputPipe<tokio::process::ChildStderr>>,
    log_path: PathBuf,
    log_offset: u64,
    log_framer: LineFramer,
    discovery: PortDiscovery,
    poll_interval: Duration,
    read_timeout: Duration,
    kill_grace: Duration,
    status: Arc<watch::Sender<Status>>,
}

impl Supervision {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                // also fires when the process handle is dropped
                _ = &mut stop_rx => {
                    self.kill().await;
                    break TransportExit::Stopped;
                }
                status = self.child.wait() => {
                    // the announcement may be the last thing it wrote
                    self.poll_log().await;
                    let reason = match status {
                        Ok(status) => format!("process exited with {}", status),
                        Err(e) => format!("failed to wait for process: {}", e),
                    };
                    log::warn!("Transport {}", reason);
                    break TransportExit::Crashed(reason);
                }
                line = next_line(&mut self.stdout) => match line {
                    Some(line) => self.observe(&line),
                    None => self.stdout = None,
                },
                line = next_line(&mut self.stderr) => match line {
                    Some(line) => self.observe(&line),
                    None => self.stderr = None,
                },
                _ = ticker.tick() => {
                    self.poll_log().await;
                }
            }
        };

        self.status.send_modify(|s| {
            if s.exit.is_none() {
                s.exit = Some(exit);
            }
        });
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            log::debug!("Transport already gone: {}", e);
        }
        match tokio::time::timeout(self.kill_grace, self.child.wait()).await {
            Ok(Ok(status)) => log::info!("Transport stopped ({})", status),
            Ok(Err(e)) => log::warn!("Failed to reap transport: {}", e),
            Err(_) => log::warn!("Transport did not exit within {:?} of being killed", self.kill_grace),
        }
    }

    fn observe(&mut self, line: &str) {
        log::debug!("transport: {}", line);

        if self.status.borrow().port.is_some() {
            return;
        }

        if let Some(port) = self.discovery.port_from_line(line) {
            log::info!("Transport listening on local port {}", port);
            self.status.send_modify(|s| {
                if s.port.is_none() {
                    s.port = Some(port);
                }
            });
        }
    }

    /// Read whatever was appended to the log file since the last poll
    async fn poll_log(&mut self) {
        let read = tokio::time::timeout(self.read_timeout, read_from(&self.log_path, self.log_offset)).await;

        let (data, len) = match read {
            Ok(Ok(Some(read))) => read,
            // not created yet
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                log::debug!("Failed to read {}: {}", self.log_path.display(), e);
                return;
            }
            Err(_) => {
                log::debug!("Reading {} timed out", self.log_path.display());
                return;
            }
        };

        if len < self.log_offset {
            // truncated underneath us
            self.log_framer = LineFramer::new();
        }
        self.log_offset = len;
        self.log_framer.push(&data);

        while let Some(line) = self.log_framer.next_line() {
            self.observe(&line.text);
        }
    }
}

/// Bytes after `offset` and the file length, `None` if the file is missing
///
/// Reads from the start when the file shrank below `offset`.
async fn read_from(path: &Path, offset: u64) -> std::io::Result<Option<(Vec<u8>, u64)>> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let len = file.metadata().await?.len();
    let start = if len < offset { 0 } else { offset };
    file.seek(std::io::SeekFrom::Start(start)).await?;

    let mut data = Vec::new();
    file.read_to_end(&mut data).await?;
    let end = start + data.len() as u64;
    Ok(Some((data, end.max(len))))
}

/// Child output pipe split into lines
///
/// Bytes are framed raw, so output that is not valid UTF-8 is decoded
/// lossily instead of ending the stream.
struct OutputPipe<R> {
    reader: R,
    framer: LineFramer,
}

impl<R: AsyncRead + Unpin> OutputPipe<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            framer: LineFramer::new(),
        }
    }

    /// Next line, `None` once the pipe hit EOF or failed
    ///
    /// Cancel safe: buffered bytes live in the framer between calls.
    async fn next_line(&mut self) -> Option<String> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(line) = self.framer.next_line() {
                return Some(line.text);
            }
            match self.reader.read(&mut chunk).await {
                Ok(0) => return self.framer.finish().map(|line| line.text),
                Ok(n) => self.framer.push(&chunk[..n]),
                Err(e) => {
                    log::debug!("Transport output closed: {}", e);
                    return None;
                }
            }
        }
    }
}

async fn next_line<R: AsyncRead + Unpin>(pipe: &mut Option<OutputPipe<R>>) -> Option<String> {
    match pipe {
        Some(pipe) => pipe.next_line().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_json() {
        let params = Obfs4Params {
            cert: "abc+/=".into(),
            iat_mode: 1,
        };
        let value: serde_json::Value = serde_json::from_str(&params.options_json()).unwrap();
        assert_eq!(value["cert"], "abc+/=");
        assert_eq!(value["iatMode"], "1");
    }

    #[test]
    fn test_format_target() {
        assert_eq!(format_target("192.0.2.1", 23050), "192.0.2.1:23050");
        assert_eq!(format_target("2001:db8::1", 443), "[2001:db8::1]:443");
    }

    #[tokio::test]
    async fn test_output_pipe_survives_invalid_utf8() {
        let data: &[u8] = b"caf\xff starting\nregistered listener: 127.0.0.1:4242\npartial";
        let mut pipe = OutputPipe::new(data);

        assert_eq!(pipe.next_line().await.unwrap(), "caf\u{fffd} starting");
        assert_eq!(pipe.next_line().await.unwrap(), "registered listener: 127.0.0.1:4242");
        assert_eq!(pipe.next_line().await.unwrap(), "partial");
        assert_eq!(pipe.next_line().await, None);
    }

    #[tokio::test]
    async fn test_read_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_from(&dir.path().join("nope.log"), 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_from_offset_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatcher.log");

        std::fs::write(&path, b"first\nsecond\n").unwrap();
        let (data, len) = read_from(&path, 0).await.unwrap().unwrap();
        assert_eq!(data, b"first\nsecond\n");
        assert_eq!(len, 13);

        let (data, _) = read_from(&path, 6).await.unwrap().unwrap();
        assert_eq!(data, b"second\n");

        std::fs::write(&path, b"new\n").unwrap();
        let (data, len) = read_from(&path, 13).await.unwrap().unwrap();
        assert_eq!(data, b"new\n");
        assert_eq!(len, 4);
    }

    #[tokio::test]
    async fn test_start_without_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = TransportSupervisor::new(TransportConfig {
            bin_dir: dir.path().join("bin"),
            state_dir: dir.path().join("state"),
            ..Default::default()
        });

        let params = Obfs4Params {
            cert: "c".into(),
            iat_mode: 0,
        };
        let err = supervisor.start("192.0.2.1", 23050, &params).await.unwrap_err();
        assert!(matches!(err, Error::TransportInstallFailed(_)));
    }
}
