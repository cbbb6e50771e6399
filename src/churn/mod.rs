//! Churn: obfuscated peer connections
//!
//! A churn connection is two plain peer connections and a pipe:
//!
//! ```text
//!  probe       discovers NAT-mapped candidates, then closes
//!  obfuscated  carries the real session, pointed at the pipe's mirrors
//!  pipe        transforms every datagram between the two worlds
//! ```
//!
//! Negotiation is gated on two independent facts: probing has finished, and
//! a transformer configuration is known (generated locally or received from
//! the peer). Once both hold, the pipe is built on the probe's ports.

mod connection;

pub use connection::ChurnConnection;

use crate::obfuscation::TransformerConfig;
use crate::peer::PeerSignal;
use crate::transport::Endpoint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Host candidate template for legacy `publicEndpoint` hints
pub const PUBLIC_ENDPOINT_CANDIDATE: &str = "candidate:0 1 UDP 2130379007 0.0.0.0 0 typ host";

/// Churn errors
#[derive(Debug, Error)]
pub enum ChurnError {
    #[error("Peer error: {0}")]
    Peer(#[from] crate::peer::PeerError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Candidate error: {0}")]
    Candidate(#[from] crate::candidate::CandidateError),

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] crate::obfuscation::ObfuscationError),

    #[error("Malformed signal: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid caesar key: {0}")]
    InvalidKey(u8),
}

/// Signalling message exchanged between churn peers.
///
/// Every field is optional; one message may carry several.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChurnSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webrtc_message: Option<PeerSignal>,
    /// Legacy shift key, 1..=255
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caesar: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_endpoint: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformer: Option<TransformerConfig>,
}

impl ChurnSignal {
    pub fn webrtc(message: PeerSignal) -> Self {
        Self {
            webrtc_message: Some(message),
            ..Default::default()
        }
    }

    pub fn caesar(key: u8) -> Self {
        Self {
            caesar: Some(key),
            ..Default::default()
        }
    }

    pub fn public_endpoint(endpoint: Endpoint) -> Self {
        Self {
            public_endpoint: Some(endpoint),
            ..Default::default()
        }
    }

    pub fn transformer(config: TransformerConfig) -> Self {
        Self {
            transformer: Some(config),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ChurnError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ChurnError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::CaesarConfig;

    #[test]
    fn test_caesar_signal_shape() {
        assert_eq!(ChurnSignal::caesar(42).to_json().unwrap(), r#"{"caesar":42}"#);
    }

    #[test]
    fn test_public_endpoint_shape() {
        let signal = ChurnSignal::from_json(
            r#"{"publicEndpoint":{"address":"18.19.20.21","port":10011}}"#,
        )
        .unwrap();
        assert_eq!(
            signal.public_endpoint,
            Some(Endpoint::new("18.19.20.21", 10011))
        );
        assert!(signal.webrtc_message.is_none());
    }

    #[test]
    fn test_webrtc_and_transformer_shape() {
        let signal = ChurnSignal {
            webrtc_message: Some(PeerSignal::NoMoreCandidates),
            transformer: Some(TransformerConfig::Caesar(CaesarConfig { key: 3 })),
            ..Default::default()
        };
        let json = signal.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"webrtcMessage":{"type":"NO_MORE_CANDIDATES"},"transformer":{"name":"caesar","config":{"key":3}}}"#
        );
        assert_eq!(ChurnSignal::from_json(&json).unwrap(), signal);
    }

    #[test]
    fn test_out_of_range_key_rejected() {
        assert!(ChurnSignal::from_json(r#"{"caesar":256}"#).is_err());
        assert!(ChurnSignal::from_json("not json").is_err());
    }
}
