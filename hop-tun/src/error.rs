//! Error types for hop-tun

use std::io;
use thiserror::Error;

/// Result type alias for hop-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or applying an interface configuration
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the host while applying a configuration
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid IP address
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid network prefix
    #[error("invalid network prefix: {0}")]
    InvalidPrefix(String),

    /// The host refused or failed to create the interface
    #[error("interface setup failed: {0}")]
    Setup(String),

    /// Tearing the interface down failed
    #[error("interface teardown failed: {0}")]
    Teardown(String),
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }
}
