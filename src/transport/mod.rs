//! Datagram transport underneath the peer connections
//!
//! Provides:
//! - `Endpoint`, the address/port pair used by candidates and signalling
//! - Bind retry with exponential backoff
//! - The obfuscation `Pipe`, which splices a packet transformer between the
//!   browser-facing mirror sockets and the public socket

mod backoff;
mod pipe;

pub use backoff::{bind_with_backoff, Backoff};
pub use pipe::{MirrorMapping, Pipe};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("No known interface to match {0}")]
    NoLocalInterface(String),

    #[error("Bind failed for {endpoint} after {attempts} attempts: {source}")]
    BindFailed {
        endpoint: String,
        attempts: u32,
        source: io::Error,
    },

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] crate::obfuscation::ObfuscationError),

    #[error("Pipe closed")]
    Closed,
}

/// A network endpoint as carried in candidates and signalling messages.
///
/// The address is kept as text so that candidate lines round-trip exactly;
/// it is parsed only when a socket needs it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Parse the address as an IP literal
    pub fn ip(&self) -> Result<IpAddr, TransportError> {
        self.address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(self.address.clone()))
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(SocketAddr::new(self.ip()?, self.port))
    }

    /// Stable lookup key, normalised through the parsed address when possible
    pub fn key(&self) -> String {
        match self.ip() {
            Ok(ip) => format!("{}:{}", ip, self.port),
            Err(_) => format!("{}:{}", self.address, self.port),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            address: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// The wildcard address of the same family as `ip`
pub fn any_interface(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Receive errors a UDP socket recovers from, such as a peer's ICMP port
/// unreachable surfacing on the next read
pub fn is_transient_recv_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
    )
}
