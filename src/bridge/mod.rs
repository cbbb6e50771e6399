//! Provider-agnostic peer connections
//!
//! A bridge wraps exactly one concrete provider and carries its signals in
//! an envelope keyed by provider name:
//!
//! ```text
//! {"signals": {"CHURN": [ {...} ]}, "first": true}
//! ```
//!
//! The side that negotiates picks the provider up front. The answering side
//! picks the best provider named in the first message it receives.

mod connection;

pub use connection::BridgingPeerConnection;

use crate::churn::ChurnError;
use crate::peer::PeerError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bridge errors
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("No provider has been created yet")]
    NoProvider,

    #[error("No supported provider found")]
    NoSupportedProvider,

    #[error("Message has no signals for current provider {0}")]
    ProviderMismatch(ProviderType),

    #[error("Message has no signals")]
    MissingSignals,

    #[error("Only one provider supported, found {0}")]
    MultipleProviders(usize),

    #[error("Only one signal supported, found {0}")]
    MultipleSignals(usize),

    #[error("Malformed signal: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Churn error: {0}")]
    Churn(#[from] ChurnError),
}

/// Concrete peer connection providers, best last
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderType {
    /// Unobfuscated connection
    Plain,
    /// Churn with the legacy public endpoint hint
    Churn,
    /// Churn without the public endpoint hint
    HoloIce,
}

impl ProviderType {
    /// Envelope key for this provider
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Plain => "PLAIN",
            ProviderType::Churn => "CHURN",
            ProviderType::HoloIce => "HOLO_ICE",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLAIN" => Ok(ProviderType::Plain),
            "CHURN" => Ok(ProviderType::Churn),
            "HOLO_ICE" => Ok(ProviderType::HoloIce),
            _ => Err(BridgeError::NoSupportedProvider),
        }
    }
}

/// Signals keyed by provider name
pub type ProviderSignals = BTreeMap<String, Vec<Value>>;

/// Bridging wire envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignallingMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals: Option<ProviderSignals>,
    /// Coarse report that the previous message could not be handled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_on_last_message: Option<bool>,
    /// Set on the first message of a signalling round
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<bool>,
}

impl SignallingMessage {
    pub fn error() -> Self {
        Self {
            error_on_last_message: Some(true),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_on_last_message == Some(true)
    }

    pub fn is_first(&self) -> bool {
        self.first == Some(true)
    }

    pub fn from_json(json: &str) -> Result<Self, BridgeError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Wrap signals of one provider
pub fn make_single_provider_message(provider: ProviderType, signals: Vec<Value>) -> SignallingMessage {
    let mut map = ProviderSignals::new();
    map.insert(provider.as_str().to_string(), signals);
    SignallingMessage {
        signals: Some(map),
        ..Default::default()
    }
}

/// Best provider named in an offer: HOLO_ICE, then CHURN, then PLAIN
pub fn pick_best_provider_type(signals: &ProviderSignals) -> Result<ProviderType, BridgeError> {
    [ProviderType::HoloIce, ProviderType::Churn, ProviderType::Plain]
        .into_iter()
        .find(|provider| signals.contains_key(provider.as_str()))
        .ok_or(BridgeError::NoSupportedProvider)
}

/// Whether a single-provider, single-signal message is NO_MORE_CANDIDATES.
///
/// Lets copy/paste signalling tell when a round is complete.
pub fn is_terminating_signal(message: &SignallingMessage) -> Result<bool, BridgeError> {
    let Some(signals) = &message.signals else {
        return Ok(false);
    };
    if signals.len() != 1 {
        return Err(BridgeError::MultipleProviders(signals.len()));
    }
    let Some((name, batch)) = signals.iter().next() else {
        return Err(BridgeError::MissingSignals);
    };
    if batch.len() != 1 {
        return Err(BridgeError::MultipleSignals(batch.len()));
    }

    let signal = &batch[0];
    let kind = match name.parse::<ProviderType>()? {
        ProviderType::Plain => signal.get("type"),
        ProviderType::Churn | ProviderType::HoloIce => signal
            .get("webrtcMessage")
            .and_then(|message| message.get("type")),
    };
    Ok(kind.and_then(Value::as_str) == Some("NO_MORE_CANDIDATES"))
}
