//! SDP helpers

use super::CandidateError;

/// Remove every `a=candidate` line from an SDP blob
pub fn filter_candidates_from_sdp(sdp: &str) -> String {
    sdp.split('\n')
        .filter(|line| !line.starts_with("a=candidate"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract the single media id (`a=mid:<id>`) from an SDP blob
pub fn get_mid_from_sdp(sdp: &str) -> Result<String, CandidateError> {
    let mids: Vec<&str> = sdp
        .split('\n')
        .filter_map(|line| line.strip_prefix("a=mid:"))
        .map(str::trim_end)
        .filter(|mid| !mid.is_empty() && !mid.contains(char::is_whitespace))
        .collect();

    match mids.as_slice() {
        [mid] => Ok(mid.to_string()),
        _ => Err(CandidateError::MidCount(mids.len())),
    }
}
