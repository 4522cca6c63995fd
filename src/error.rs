//! Error types for the DHCP server.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.
//!
//! Running out of addresses or looking up an address the pool never handed
//! out are not errors: the lease pool reports those as `None` / `false` and
//! the coordinator decides how to answer the client.

use std::net::Ipv4Addr;

/// Errors that can occur during DHCP server operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config file).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or unsupported DHCP packet received.
    ///
    /// This includes packets that are too short, have invalid magic cookies,
    /// invalid option lengths, or carry a message type a server never accepts.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// The configured address range is inverted.
    ///
    /// Fatal at startup; a pool is never built from such a range.
    #[error("Invalid address range: {start} is greater than {end}")]
    InvalidRange { start: Ipv4Addr, end: Ipv4Addr },

    /// Invalid server configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) for every
    /// problem other than an inverted range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without administrator privileges.
    #[error("Socket error: {0}")]
    Socket(String),
}

/// A specialized Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, Error>;
