//! Peer connection capability
//!
//! The churn and bridging layers are written against the `PeerConnection`
//! trait rather than a concrete WebRTC stack. A connection:
//! - produces outbound signals on a queue, to be relayed to the remote peer
//! - consumes inbound signals through `handle_signal_message`
//! - announces data channels opened by the remote side on a second queue
//! - publishes its lifecycle through a `StateWatch`
//!
//! `UdpPeerConnection` is a small datagram implementation with ICE-style
//! candidates, used by the demo binary and the tests.

mod channel;
mod signal;
mod state;
mod udp;

pub use channel::DataChannel;
pub use signal::{PeerSignal, SessionDescription};
pub use state::{ConnectionState, StateSender, StateWatch};
pub use udp::{UdpPeerConnection, UdpPeerFactory};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

/// Peer connection errors
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed before it was established")]
    ClosedBeforeConnected,

    #[error("Connection closed")]
    Closed,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Candidate error: {0}")]
    Candidate(#[from] crate::candidate::CandidateError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}

/// Configuration handed to a new peer connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfig {
    /// STUN/TURN server URLs
    #[serde(default)]
    pub ice_servers: Vec<String>,
}

impl RtcConfig {
    pub fn with_ice_servers(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

/// A negotiated, signal-driven peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    /// Signalling message exchanged with the remote peer
    type Signal: Send + 'static;

    /// Start negotiating as the offering side
    async fn negotiate_connection(&self) -> Result<(), PeerError>;

    /// Feed one signal received from the remote peer
    async fn handle_signal_message(&self, signal: Self::Signal) -> Result<(), PeerError>;

    async fn open_data_channel(&self, label: &str) -> Result<DataChannel, PeerError>;

    async fn close(&self) -> Result<(), PeerError>;

    /// Outbound signals; can be taken once
    fn take_signal_queue(&mut self) -> Option<UnboundedReceiver<Self::Signal>>;

    /// Data channels opened by the remote side; can be taken once
    fn take_channel_queue(&mut self) -> Option<UnboundedReceiver<DataChannel>>;

    fn state(&self) -> StateWatch;
}

/// Creates the plain peer connections that obfuscating layers wrap
#[async_trait]
pub trait PeerFactory: Send + Sync + 'static {
    type Connection: PeerConnection<Signal = PeerSignal>;

    async fn create(&self, name: &str, config: &RtcConfig) -> Result<Self::Connection, PeerError>;
}
