//! Opening the byte stream to the tunnel engine's control channel

use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> AsyncStream for T {}

/// Boxed control channel stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens the control channel for a tunnel towards `target`
///
/// `target` is the gateway itself for direct routes and the local proxy for
/// obfuscated ones.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, target: SocketAddr) -> io::Result<BoxedStream>;
}

/// Dials the target over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl ChannelConnector for TcpConnector {
    async fn connect(&self, target: SocketAddr) -> io::Result<BoxedStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connecting to {} timed out", target)))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Connects to the engine's local management socket
///
/// The engine is told where to connect with `remote MOD <host> <port>`.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixSocketConnector {
    path: PathBuf,
}

#[cfg(unix)]
impl UnixSocketConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(unix)]
#[async_trait]
impl ChannelConnector for UnixSocketConnector {
    async fn connect(&self, target: SocketAddr) -> io::Result<BoxedStream> {
        use tokio::io::AsyncWriteExt;

        let mut stream = tokio::net::UnixStream::connect(&self.path).await?;

        let command = hop_mgmt::Command::remote_modify(&target.ip().to_string(), target.port());
        let bytes = command
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        stream.write_all(&bytes).await?;

        log::debug!("Pointed engine at {} via {}", target, self.path.display());
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_dials_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b">INFO:hello\n").await.unwrap();
        });

        let mut stream = TcpConnector::default().connect(addr).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b">INFO:hello\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(TcpConnector::default().connect(addr).await.is_err());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_unix_connector_sends_remote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mgmt.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            buf.truncate(n);
            buf
        });

        let _stream = UnixSocketConnector::new(&path)
            .connect("127.0.0.1:4242".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(server.await.unwrap(), b"remote MOD 127.0.0.1 4242\n");
    }
}
