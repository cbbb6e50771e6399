//! # Churn Tunnel
//!
//! Obfuscated peer-to-peer datagram connections.
//!
//! A churn connection runs two peer connections: a short-lived probe that
//! discovers the host's addresses, and the real connection whose traffic is
//! routed through a local pipe. The pipe reshapes every datagram with a
//! pluggable transformer, so what crosses the network no longer looks like
//! the protocol inside it.
//!
//! ## Features
//!
//! - **Candidate handling**: ICE candidate grammar, SDP helpers, NAT hints
//! - **Packet transformers**: Caesar, AES-CBC, RC4, byte-sequence injection,
//!   range-coder shaping, fragmentation and the Protean composite
//! - **Obfuscation pipe**: mirror sockets between the local agent and the
//!   network, with per-interface replication
//! - **Bridging**: provider selection over a signalling envelope
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Bridging Layer                     │
//! │        (Provider selection, signal envelope)         │
//! ├─────────────────────────────────────────────────────┤
//! │                    Churn Layer                       │
//! │     (Probe, transformer negotiation, mappings)       │
//! ├─────────────────────────────────────────────────────┤
//! │                 Obfuscation Layer                    │
//! │   (Transformers, fragmentation, reassembly)          │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │         (Pipe, mirror sockets, bind backoff)         │
//! ├─────────────────────────────────────────────────────┤
//! │                    Peer Layer                        │
//! │       (PeerConnection capability, UDP peer)          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod bridge;
pub mod candidate;
pub mod churn;
pub mod config;
pub mod crypto;
pub mod obfuscation;
pub mod peer;
pub mod transport;

pub use bridge::{BridgingPeerConnection, ProviderType, SignallingMessage};
pub use churn::{ChurnConnection, ChurnSignal};
pub use config::Config;
pub use peer::{PeerConnection, PeerFactory};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default upper bound on probe candidate gathering
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3000;

/// Largest datagram read from any pipe socket
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candidate error: {0}")]
    Candidate(#[from] candidate::CandidateError),

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] obfuscation::ObfuscationError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Peer error: {0}")]
    Peer(#[from] peer::PeerError),

    #[error("Churn error: {0}")]
    Churn(#[from] churn::ChurnError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] bridge::BridgeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}
