//! Tunnel Engine Management Protocol
//!
//! A line-oriented command/event protocol spoken with an external tunnel
//! engine over a point-to-point byte stream. Commands are single lines of
//! text; the engine answers with `SUCCESS:`/`ERROR:` replies and pushes
//! asynchronous real-time messages prefixed with `>`.
//!
//! This crate only owns framing and decoding. The byte stream itself (TCP,
//! Unix socket, in-memory pipe) belongs to the caller.
//!
//! ```rust
//! use hop_mgmt::{decode_line, Command, ConnectionLevel, Event, LineFramer};
//!
//! let mut framer = LineFramer::new();
//! framer.push(b">STATE:1700000000,CONNECTED,SUCCESS,10.8.0.2,198.51.100.7\r\n");
//!
//! let line = framer.next_line().unwrap();
//! match decode_line(&line.text) {
//!     Event::Status(status) => assert_eq!(status.level, ConnectionLevel::Connected),
//!     other => panic!("unexpected event: {:?}", other),
//! }
//!
//! let bytes = Command::hold_release().encode().unwrap();
//! assert_eq!(bytes, b"hold release\n");
//! ```

mod command;
mod error;
mod event;
mod framing;

pub use command::{encode_command, Command, Signal};
pub use error::{Error, Result};
pub use event::{decode_line, ConnectionLevel, Event, InterfaceParam, LogLevel, StatusUpdate};
pub use framing::{Line, LineFramer};

/// Maximum accepted length of a single line, in bytes
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Prefix of asynchronous real-time messages pushed by the engine
pub const REALTIME_PREFIX: char = '>';
