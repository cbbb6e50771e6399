//! Plain peer connection signals
//!
//! ```json
//! {"type":"OFFER","description":{"type":"offer","sdp":"v=0..."}}
//! {"type":"CANDIDATE","candidate":{"candidate":"candidate:...","sdpMid":"data","sdpMLineIndex":0}}
//! {"type":"NO_MORE_CANDIDATES"}
//! ```

use crate::candidate::IceCandidate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// `offer` or `answer`
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerSignal {
    #[serde(rename = "OFFER")]
    Offer { description: SessionDescription },
    #[serde(rename = "ANSWER")]
    Answer { description: SessionDescription },
    #[serde(rename = "CANDIDATE")]
    Candidate { candidate: IceCandidate },
    #[serde(rename = "NO_MORE_CANDIDATES")]
    NoMoreCandidates,
}

impl PeerSignal {
    /// The SDP of an offer or answer
    pub fn description(&self) -> Option<&SessionDescription> {
        match self {
            PeerSignal::Offer { description } | PeerSignal::Answer { description } => {
                Some(description)
            }
            _ => None,
        }
    }

    pub fn is_offer(&self) -> bool {
        matches!(self, PeerSignal::Offer { .. })
    }
}
