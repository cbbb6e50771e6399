//! Candidate line grammar (RFC 5245 section 15.1)
//!
//! ```text
//! candidate:<foundation> <component> <transport> <priority>
//!     <address> <port> typ <type> [raddr <address> rport <port>]
//!     *(<extension-key> <extension-value>)
//! ```
//!
//! Parsing and formatting are exact inverses: transport case, address text
//! and extension order are preserved verbatim.

use super::CandidateError;
use crate::transport::Endpoint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const LINE_PREFIX: &str = "candidate:";

/// Candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::Srflx => "srflx",
            CandidateType::Prflx => "prflx",
            CandidateType::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = CandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::Srflx),
            "prflx" => Ok(CandidateType::Prflx),
            "relay" => Ok(CandidateType::Relay),
            _ => Err(CandidateError::InvalidType(s.to_string())),
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate as carried in signalling: the line plus its media binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// One parsed ICE candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u32,
    /// Transport token exactly as received (`udp`, `UDP`, `tcp`, ...)
    pub protocol: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
    /// Extension attributes in order of appearance
    pub extensions: Vec<(String, String)>,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

fn number<T: FromStr>(token: &str) -> Result<T, CandidateError> {
    token
        .parse()
        .map_err(|_| CandidateError::NotANumber(token.to_string()))
}

impl Candidate {
    /// Parse a candidate line
    pub fn parse(line: &str) -> Result<Self, CandidateError> {
        let tokens: Vec<&str> = line.split(' ').collect();
        if tokens.len() < 8 || tokens[6] != "typ" {
            return Err(CandidateError::Invalid(line.to_string()));
        }
        let foundation = tokens[0]
            .strip_prefix(LINE_PREFIX)
            .ok_or_else(|| CandidateError::Invalid(line.to_string()))?;

        let mut candidate = Candidate {
            foundation: foundation.to_string(),
            component: number(tokens[1])?,
            protocol: tokens[2].to_string(),
            priority: number(tokens[3])?,
            ip: tokens[4].to_string(),
            port: number(tokens[5])?,
            candidate_type: tokens[7].parse()?,
            related_address: None,
            related_port: None,
            extensions: Vec::new(),
            sdp_mid: None,
            sdp_mline_index: None,
        };

        let mut next = 8;
        if tokens.get(8) == Some(&"raddr") {
            if tokens.get(10) != Some(&"rport") || tokens.len() < 12 {
                return Err(CandidateError::MissingRport(line.to_string()));
            }
            candidate.related_address = Some(tokens[9].to_string());
            candidate.related_port = Some(number(tokens[11])?);
            next = 12;
        }

        let mut rest = tokens[next..].iter();
        while let Some(key) = rest.next() {
            let value = rest
                .next()
                .ok_or_else(|| CandidateError::DanglingExtension(key.to_string()))?;
            candidate
                .extensions
                .push((key.to_string(), value.to_string()));
        }

        Ok(candidate)
    }

    /// Format as a candidate line; the inverse of `parse`
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{}{} {} {} {} {} {} typ {}",
            LINE_PREFIX,
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.ip,
            self.port,
            self.candidate_type
        );
        if let Some(raddr) = &self.related_address {
            line.push_str(&format!(
                " raddr {} rport {}",
                raddr,
                self.related_port.unwrap_or(0)
            ));
        }
        for (key, value) in &self.extensions {
            line.push(' ');
            line.push_str(key);
            line.push(' ');
            line.push_str(value);
        }
        line
    }

    pub fn from_ice_candidate(ice: &IceCandidate) -> Result<Self, CandidateError> {
        let mut candidate = Self::parse(&ice.candidate)?;
        candidate.sdp_mid = ice.sdp_mid.clone();
        candidate.sdp_mline_index = ice.sdp_mline_index;
        Ok(candidate)
    }

    pub fn to_ice_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: self.to_line(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
        }
    }

    pub fn is_udp(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("udp")
    }

    /// The connection address of this candidate
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.ip.clone(), self.port)
    }

    /// The endpoint the local ICE agent is actually bound to.
    ///
    /// Host candidates are their own base; server-reflexive candidates name
    /// their base in `raddr`/`rport`. Other types have no usable base.
    pub fn local_endpoint(&self) -> Result<Endpoint, CandidateError> {
        match self.candidate_type {
            CandidateType::Host => Ok(self.endpoint()),
            CandidateType::Srflx => match (&self.related_address, self.related_port) {
                (Some(address), Some(port)) => Ok(Endpoint::new(address.clone(), port)),
                _ => Err(CandidateError::UnsupportedCandidateType(self.candidate_type)),
            },
            other => Err(CandidateError::UnsupportedCandidateType(other)),
        }
    }

    /// A copy advertising `endpoint` instead of this candidate's own address
    pub fn with_endpoint(&self, endpoint: &Endpoint) -> Self {
        let mut copy = self.clone();
        copy.ip = endpoint.address.clone();
        copy.port = endpoint.port;
        copy
    }
}

impl FromStr for Candidate {
    type Err = CandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Candidate::parse(s)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "candidate:129713316 2 udp 2122129151 172.26.108.25 40762 typ host generation 0";
    const SRFLX_V6: &str = "candidate:9097 1 udp 4175 ::1 50840 typ srflx raddr 2001:DB8::1 rport 56635";
    const RELAY: &str = "candidate:3 1 udp 41885439 18.19.20.21 3478 typ relay raddr 172.26.108.25 rport 40762 generation 0";
    const TCP_ACTIVE: &str = "candidate:1302982778 1 tcp 1518214911 172.29.18.131 0 typ host tcptype active generation 0";

    #[test]
    fn test_parse_host() {
        let c = Candidate::parse(HOST).unwrap();
        assert_eq!(c.foundation, "129713316");
        assert_eq!(c.component, 2);
        assert_eq!(c.protocol, "udp");
        assert_eq!(c.priority, 2122129151);
        assert_eq!(c.ip, "172.26.108.25");
        assert_eq!(c.port, 40762);
        assert_eq!(c.candidate_type, CandidateType::Host);
        assert_eq!(c.related_address, None);
        assert_eq!(c.extensions, vec![("generation".to_string(), "0".to_string())]);
    }

    #[test]
    fn test_round_trip() {
        for line in [
            HOST,
            SRFLX_V6,
            RELAY,
            TCP_ACTIVE,
            "candidate:0 1 UDP 2130379007 18.19.20.21 10011 typ host",
            "candidate:1 1 udp 1 10.0.0.1 9 typ host network-id 3 generation 0 ufrag abcd",
        ] {
            assert_eq!(Candidate::parse(line).unwrap().to_line(), line);
        }
    }

    #[test]
    fn test_local_endpoint_host() {
        let c = Candidate::parse(HOST).unwrap();
        assert_eq!(c.local_endpoint().unwrap(), Endpoint::new("172.26.108.25", 40762));
    }

    #[test]
    fn test_local_endpoint_srflx_uses_base() {
        let c = Candidate::parse(SRFLX_V6).unwrap();
        assert_eq!(c.local_endpoint().unwrap(), Endpoint::new("2001:DB8::1", 56635));
    }

    #[test]
    fn test_local_endpoint_relay_fails() {
        let c = Candidate::parse(RELAY).unwrap();
        assert_eq!(
            c.local_endpoint(),
            Err(CandidateError::UnsupportedCandidateType(CandidateType::Relay))
        );
    }

    #[test]
    fn test_tcp_port_zero_is_accepted() {
        let c = Candidate::parse(TCP_ACTIVE).unwrap();
        assert!(!c.is_udp());
        assert_eq!(c.local_endpoint().unwrap(), Endpoint::new("172.29.18.131", 0));
    }

    #[test]
    fn test_reject_malformed() {
        assert!(matches!(
            Candidate::parse("candidate:9097 1 udp 4175 xxx yyy typ host generation 0"),
            Err(CandidateError::NotANumber(_))
        ));
        assert!(matches!(Candidate::parse("abc def"), Err(CandidateError::Invalid(_))));
        assert!(matches!(
            Candidate::parse("candidate:1 1 udp 1 10.0.0.1 9 type host"),
            Err(CandidateError::Invalid(_))
        ));
        assert!(matches!(
            Candidate::parse("candidate:1 x udp 1 10.0.0.1 9 typ host"),
            Err(CandidateError::NotANumber(_))
        ));
        assert!(matches!(
            Candidate::parse("candidate:1 1 udp -5 10.0.0.1 9 typ host"),
            Err(CandidateError::NotANumber(_))
        ));
        assert!(matches!(
            Candidate::parse("candidate:1 1 udp 1 10.0.0.1 9 typ srflx raddr 10.0.0.2 port 9"),
            Err(CandidateError::MissingRport(_))
        ));
        assert!(matches!(
            Candidate::parse("candidate:1 1 udp 1 10.0.0.1 9 typ host generation"),
            Err(CandidateError::DanglingExtension(_))
        ));
        assert!(matches!(
            Candidate::parse("candidate:1 1 udp 1 10.0.0.1 9 typ magic"),
            Err(CandidateError::InvalidType(_))
        ));
    }

    #[test]
    fn test_with_endpoint_leaves_original_untouched() {
        let original = Candidate::parse(HOST).unwrap();
        let copy = original.with_endpoint(&Endpoint::new("127.0.0.1", 5000));
        assert_eq!(copy.ip, "127.0.0.1");
        assert_eq!(copy.port, 5000);
        assert_eq!(copy.priority, original.priority);
        assert_eq!(original.port, 40762);
    }

    #[test]
    fn test_ice_candidate_json() {
        let json = format!(r#"{{"candidate":"{}","sdpMid":"data","sdpMLineIndex":0}}"#, HOST);
        let ice: IceCandidate = serde_json::from_str(&json).unwrap();
        let c = Candidate::from_ice_candidate(&ice).unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("data"));
        assert_eq!(c.sdp_mline_index, Some(0));
        assert_eq!(c.to_ice_candidate(), ice);
    }
}
