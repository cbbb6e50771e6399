//! Public address selection for legacy NAT hints

use super::{Candidate, CandidateError, CandidateType};
use crate::transport::Endpoint;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A NAT mapping: where the local agent listens and where the world sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatPair {
    pub internal: Endpoint,
    pub external: Endpoint,
}

fn parse_ip(address: &str) -> Option<IpAddr> {
    let ip: IpAddr = address.parse().ok()?;
    // IPv4-mapped IPv6 addresses are treated as the IPv4 address they carry
    match ip {
        IpAddr::V6(v6) => Some(
            v6.to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
        ),
        v4 => Some(v4),
    }
}

fn is_global_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    !(ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_link_local()
        || ip.is_loopback()
        || ip.is_private()
        // carrier-grade NAT, 100.64.0.0/10
        || (a == 100 && (b & 0xc0) == 64)
        // reserved, 240.0.0.0/4
        || a >= 240
        || ip.is_documentation())
}

fn is_global_v6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // link-local, fe80::/10
        || (segments[0] & 0xffc0) == 0xfe80
        // unique local, fc00::/7
        || (segments[0] & 0xfe00) == 0xfc00
        // documentation, 2001:db8::/32
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
        // teredo, 2001::/32
        || (segments[0] == 0x2001 && segments[1] == 0)
        // 6to4, 2002::/16
        || segments[0] == 0x2002)
}

/// Whether an address is routable on the public Internet
pub(crate) fn is_unicast(address: &str) -> bool {
    match parse_ip(address) {
        Some(IpAddr::V4(v4)) => is_global_v4(&v4),
        Some(IpAddr::V6(v6)) => is_global_v6(&v6),
        None => false,
    }
}

/// Preference vector, most significant criterion first
fn score(c: &Candidate) -> [bool; 4] {
    let ip = parse_ip(&c.ip);
    [
        c.is_udp(),
        matches!(ip, Some(IpAddr::V4(_))),
        c.candidate_type == CandidateType::Host && is_unicast(&c.ip),
        c.candidate_type == CandidateType::Srflx,
    ]
}

/// Pick the candidate most likely to be reachable from outside.
///
/// Preference: a public host address, then server-reflexive, then a private
/// host address (STUN failed; only works if the other side is routable).
pub fn select_public_address(candidates: &[Candidate]) -> Result<NatPair, CandidateError> {
    let mut ranked: Vec<&Candidate> = candidates.iter().collect();
    // stable, so ties keep their original order
    ranked.sort_by(|a, b| score(b).cmp(&score(a)));

    let best = ranked.first().ok_or(CandidateError::NoPublicCandidate)?;
    match best.candidate_type {
        CandidateType::Srflx => Ok(NatPair {
            internal: best.local_endpoint()?,
            external: best.endpoint(),
        }),
        CandidateType::Host => Ok(NatPair {
            internal: best.endpoint(),
            external: best.endpoint(),
        }),
        _ => Err(CandidateError::NoPublicCandidate),
    }
}
