//! Finding the local port in the transport's output
//!
//! The transport announces its listener with a free-form log line such as
//!
//! ```text
//! 2024/03/01 10:00:00 [NOTICE]: obfs4 - registered listener: 127.0.0.1:34567
//! ```
//!
//! The last whitespace-separated token holds the address; the text after its
//! last `:` is the port.

/// Extracts the announced port from transport output lines
#[derive(Debug, Clone)]
pub struct PortDiscovery {
    marker: String,
}

impl PortDiscovery {
    /// Match lines containing `marker`
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    /// The port announced by `line`, if it is an announcement
    pub fn port_from_line(&self, line: &str) -> Option<u16> {
        if !line.contains(&self.marker) {
            return None;
        }

        let token = line.split_whitespace().last()?;
        let (_, port) = token.rsplit_once(':')?;
        match port.parse::<u16>() {
            Ok(0) | Err(_) => {
                log::debug!("Announcement without a usable port: {}", line);
                None
            }
            Ok(port) => Some(port),
        }
    }
}
