//! Error types for the management protocol

use thiserror::Error;

/// Result type alias for management protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding management commands
///
/// Decoding never fails: unknown or malformed lines become
/// [`Event::Raw`](crate::Event::Raw).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("invalid argument {index} for '{command}': {reason}")]
    InvalidArgument {
        command: String,
        index: usize,
        reason: String,
    },
}
