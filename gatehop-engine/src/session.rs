//! A live control channel session
//!
//! The stream is split: commands are written from the owning task while a
//! reader task frames and decodes inbound lines and queues them in wire
//! order.

use std::time::Duration;

use hop_mgmt::{decode_line, Command, Event, LineFramer};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connector::BoxedStream;
use crate::error::{Error, Result};

const EVENT_QUEUE: usize = 256;
const READ_BUF: usize = 4096;

/// Connection to the engine's control channel
pub struct ControlSession {
    writer: WriteHalf<BoxedStream>,
    events: mpsc::Receiver<Event>,
    reader: JoinHandle<()>,
}

impl ControlSession {
    /// Take over `stream` and start reading from it
    pub fn open(stream: BoxedStream) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        let (tx, events) = mpsc::channel(EVENT_QUEUE);
        let reader = tokio::spawn(read_events(read_half, tx));

        Self {
            writer,
            events,
            reader,
        }
    }

    /// Write one command
    pub async fn send(&mut self, command: &Command) -> Result<()> {
        let bytes = command.encode()?;
        log::debug!("-> {}", command);

        let written = async {
            self.writer.write_all(&bytes).await?;
            self.writer.flush().await
        }
        .await;

        written.map_err(|e| {
            log::debug!("Control channel write failed: {}", e);
            Error::ChannelClosed
        })
    }

    /// Next decoded event, `None` once the engine closed the channel
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Discard events until the engine closes the channel
    ///
    /// Returns false if it is still open after `grace`.
    pub async fn wait_closed(&mut self, grace: Duration) -> bool {
        tokio::time::timeout(grace, async {
            while let Some(event) = self.events.recv().await {
                log::debug!("<- {:?} (closing)", event);
            }
        })
        .await
        .is_ok()
    }

    /// Close our side of the channel
    pub async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            log::debug!("Control channel shutdown: {}", e);
        }
        self.reader.abort();
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_events(mut reader: ReadHalf<BoxedStream>, tx: mpsc::Sender<Event>) {
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; READ_BUF];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::debug!("Control channel read failed: {}", e);
                break;
            }
        };

        framer.push(&buf[..n]);
        while let Some(line) = framer.next_line() {
            if !forward(&tx, &line).await {
                return;
            }
        }
    }

    if let Some(line) = framer.finish() {
        forward(&tx, &line).await;
    }
    log::debug!("Control channel closed by engine");
}

/// Decode and queue one line, false once nobody listens
async fn forward(tx: &mpsc::Sender<Event>, line: &hop_mgmt::Line) -> bool {
    if line.truncated {
        log::warn!("Control channel line exceeded the maximum length and was truncated");
    }
    let event = decode_line(&line.text);
    log::trace!("<- {:?}", event);
    tx.send(event).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hop_mgmt::{ConnectionLevel, Signal};
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (client, mut engine) = tokio::io::duplex(1024);
        let mut session = ControlSession::open(Box::new(client));

        engine
            .write_all(b">STATE:1,WAIT,,,\r\n>BYTECOUNT:1,2\r\n>STATE:2,CONNECTED,SUCCESS,10.8.0.2,\r\n")
            .await
            .unwrap();

        assert!(matches!(session.next_event().await, Some(Event::Status(s)) if s.state == "WAIT"));
        assert!(matches!(session.next_event().await, Some(Event::ByteCount { .. })));
        assert!(matches!(
            session.next_event().await,
            Some(Event::Status(s)) if s.level == ConnectionLevel::Connected
        ));
    }

    #[tokio::test]
    async fn test_send_writes_lines() {
        let (client, engine) = tokio::io::duplex(1024);
        let mut session = ControlSession::open(Box::new(client));

        session.send(&Command::state_on()).await.unwrap();
        session.send(&Command::signal(Signal::Sigint)).await.unwrap();

        let mut lines = BufReader::new(engine).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "state on");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "signal SIGINT");
    }

    #[tokio::test]
    async fn test_close_is_observed() {
        let (client, mut engine) = tokio::io::duplex(1024);
        let mut session = ControlSession::open(Box::new(client));

        // unterminated last line still counts
        engine.write_all(b"SUCCESS: bye").await.unwrap();
        drop(engine);

        assert!(matches!(session.next_event().await, Some(Event::Reply { ok: true, .. })));
        assert!(session.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_wait_closed_times_out_on_open_channel() {
        let (client, _engine) = tokio::io::duplex(1024);
        let mut session = ControlSession::open(Box::new(client));
        assert!(!session.wait_closed(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_send_after_engine_gone() {
        let (client, engine) = tokio::io::duplex(16);
        let mut session = ControlSession::open(Box::new(client));
        drop(engine);

        let err = session.send(&Command::state_on()).await.unwrap_err();
        assert!(matches!(err, Error::ChannelClosed));
    }
}
