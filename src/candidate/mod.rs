//! ICE candidates and the SDP plumbing around them
//!
//! Provides:
//! - `Candidate`, a lossless parser/formatter for RFC 5245 candidate lines
//! - SDP helpers that strip candidate lines and extract the media id
//! - The public-address heuristic used for legacy NAT hints

mod line;
mod nat;
mod sdp;

pub use line::{Candidate, CandidateType, IceCandidate};
pub use nat::{select_public_address, NatPair};
pub use sdp::{filter_candidates_from_sdp, get_mid_from_sdp};

use thiserror::Error;

/// Candidate and SDP errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CandidateError {
    #[error("Invalid candidate: {0}")]
    Invalid(String),

    #[error("{0} is not a number")]
    NotANumber(String),

    #[error("Unknown candidate type: {0}")]
    InvalidType(String),

    #[error("Missing rport: {0}")]
    MissingRport(String),

    #[error("Extension {0} has no value")]
    DanglingExtension(String),

    #[error("Unsupported candidate type for local endpoint: {0}")]
    UnsupportedCandidateType(CandidateType),

    #[error("No srflx or host candidate found")]
    NoPublicCandidate,

    #[error("Expected 1 mid, but there are actually {0}")]
    MidCount(usize),
}
