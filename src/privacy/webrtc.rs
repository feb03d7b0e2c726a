//! WebRTC ICE candidate sanitization.
//!
//! ICE candidates leak local and public addresses to any page that can
//! open a peer connection. The sanitizer parses each candidate line,
//! then, under policy: rewrites host-candidate IPs to stable salted
//! mDNS names, drops IPv6 or disabled transports, and restricts the
//! surviving set down to relay-only at the strictest level.

use std::net::IpAddr;

use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// ICE candidate policy by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IcePolicy {
    /// Emit candidates untouched.
    All,
    /// Host candidates hide behind mDNS names; reflexive and relay pass.
    Default,
    /// Host candidates hide behind mDNS names; reflexive candidates are
    /// dropped since they expose the public address.
    MdnsOnly,
    /// Only relay candidates survive.
    RelayOnly,
}

/// A parsed `candidate:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u32,
    pub transport: String,
    pub priority: u64,
    pub address: String,
    pub port: u16,
    pub candidate_type: String,
    /// Attributes after the type, preserved verbatim.
    pub trailing: Vec<String>,
}

impl IceCandidate {
    /// Parse an ICE candidate attribute line.
    pub fn parse(line: &str) -> Option<Self> {
        let body = line.strip_prefix("candidate:")?;
        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() < 8 || fields[6] != "typ" {
            return None;
        }
        Some(Self {
            foundation: fields[0].to_string(),
            component: fields[1].parse().ok()?,
            transport: fields[2].to_ascii_lowercase(),
            priority: fields[3].parse().ok()?,
            address: fields[4].to_string(),
            port: fields[5].parse().ok()?,
            candidate_type: fields[7].to_string(),
            trailing: fields[8..].iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Serialize back into attribute-line form.
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.candidate_type
        );
        for attr in &self.trailing {
            line.push(' ');
            line.push_str(attr);
        }
        line
    }

    fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }
}

/// Candidate filter with a per-session salt for stable mDNS naming.
pub struct IceSanitizer {
    policy: IcePolicy,
    pub disable_ipv6: bool,
    pub disable_tcp: bool,
    pub disable_udp: bool,
    salt: [u8; 16],
    /// IP → synthesized name, for log symmetry; the derivation itself is
    /// deterministic per salt.
    names: DashMap<IpAddr, String>,
}

impl IceSanitizer {
    pub fn new(policy: IcePolicy) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        Self {
            policy,
            disable_ipv6: matches!(policy, IcePolicy::MdnsOnly | IcePolicy::RelayOnly),
            disable_tcp: false,
            disable_udp: false,
            salt,
            names: DashMap::new(),
        }
    }

    pub fn policy(&self) -> IcePolicy {
        self.policy
    }

    /// Apply the policy to a candidate set, returning the surviving
    /// (possibly rewritten) lines.
    pub fn sanitize(&self, candidates: &[String]) -> Vec<String> {
        candidates
            .iter()
            .filter_map(|line| {
                let Some(candidate) = IceCandidate::parse(line) else {
                    debug!("dropping unparseable ice candidate");
                    return None;
                };
                self.sanitize_one(candidate).map(|c| c.to_line())
            })
            .collect()
    }

    fn sanitize_one(&self, mut candidate: IceCandidate) -> Option<IceCandidate> {
        // Transport and address-family disables are explicit switches and
        // apply under every policy, passthrough included.
        if self.disable_tcp && candidate.transport == "tcp" {
            return None;
        }
        if self.disable_udp && candidate.transport == "udp" {
            return None;
        }
        if let Some(ip) = candidate.ip() {
            if self.disable_ipv6 && ip.is_ipv6() {
                return None;
            }
        }

        match self.policy {
            IcePolicy::All => return Some(candidate),
            IcePolicy::RelayOnly => {
                if candidate.candidate_type != "relay" {
                    return None;
                }
            }
            IcePolicy::MdnsOnly => {
                if matches!(candidate.candidate_type.as_str(), "srflx" | "prflx") {
                    return None;
                }
            }
            IcePolicy::Default => {}
        }

        // mDNS enforcement: no literal IP may appear in a host
        // candidate.
        if let Some(ip) = candidate.ip() {
            if candidate.candidate_type == "host" {
                candidate.address = self.mdns_name(ip);
            }
        }
        Some(candidate)
    }

    /// Stable synthetic `<hash>.local` name for an IP within this
    /// session.
    pub fn mdns_name(&self, ip: IpAddr) -> String {
        if let Some(existing) = self.names.get(&ip) {
            return existing.clone();
        }
        let mut hasher = Sha256::new();
        hasher.update(self.salt);
        hasher.update(ip.to_string().as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
        let name = format!(
            "{}-{}-{}-{}-{}.local",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        );
        self.names.insert(ip, name.clone());
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "candidate:1 1 udp 2122260223 192.168.1.7 56789 typ host";
    const HOST_V6: &str = "candidate:2 1 udp 2122187007 2001:db8::7 56790 typ host";
    const SRFLX: &str =
        "candidate:3 1 udp 1686052607 203.0.113.50 56791 typ srflx raddr 192.168.1.7 rport 56789";
    const RELAY: &str =
        "candidate:4 1 udp 41885439 198.51.100.9 3478 typ relay raddr 203.0.113.50 rport 56791";
    const TCP_HOST: &str = "candidate:5 1 tcp 1518280447 192.168.1.7 9 typ host tcptype active";

    fn all_candidates() -> Vec<String> {
        [HOST, HOST_V6, SRFLX, RELAY, TCP_HOST]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn parse_round_trips() {
        let candidate = IceCandidate::parse(SRFLX).unwrap();
        assert_eq!(candidate.candidate_type, "srflx");
        assert_eq!(candidate.address, "203.0.113.50");
        assert_eq!(candidate.port, 56791);
        assert_eq!(candidate.to_line(), SRFLX);
    }

    #[test]
    fn mdns_rewrite_hides_host_ips_stably() {
        let sanitizer = IceSanitizer::new(IcePolicy::Default);
        let output = sanitizer.sanitize(&[HOST.to_string()]);
        assert_eq!(output.len(), 1);
        let rewritten = IceCandidate::parse(&output[0]).unwrap();
        assert!(rewritten.address.ends_with(".local"));
        assert!(!output[0].contains("192.168.1.7"));

        // Same IP, same name within the session.
        let again = sanitizer.sanitize(&[HOST.to_string()]);
        let rewritten_again = IceCandidate::parse(&again[0]).unwrap();
        assert_eq!(rewritten.address, rewritten_again.address);

        // A different sanitizer (new session, new salt) gives another name.
        let other_session = IceSanitizer::new(IcePolicy::Default);
        let other = other_session.sanitize(&[HOST.to_string()]);
        let other_candidate = IceCandidate::parse(&other[0]).unwrap();
        assert_ne!(rewritten.address, other_candidate.address);
    }

    #[test]
    fn no_literal_ip_survives_mdns_enforcement_on_host_candidates() {
        let sanitizer = IceSanitizer::new(IcePolicy::MdnsOnly);
        let output = sanitizer.sanitize(&all_candidates());
        for line in &output {
            let candidate = IceCandidate::parse(line).unwrap();
            if candidate.candidate_type == "host" {
                assert!(candidate.ip().is_none(), "literal ip leaked: {line}");
            }
        }
    }

    #[test]
    fn mdns_only_drops_reflexive_candidates() {
        let sanitizer = IceSanitizer::new(IcePolicy::MdnsOnly);
        let output = sanitizer.sanitize(&all_candidates());
        assert!(output.iter().all(|l| !l.contains("typ srflx")));
        // Relay still passes.
        assert!(output.iter().any(|l| l.contains("typ relay")));
    }

    #[test]
    fn relay_only_keeps_exactly_relays() {
        let sanitizer = IceSanitizer::new(IcePolicy::RelayOnly);
        let output = sanitizer.sanitize(&all_candidates());
        assert_eq!(output.len(), 1);
        assert!(output[0].contains("typ relay"));
    }

    #[test]
    fn ipv6_and_tcp_filters_apply() {
        let mut sanitizer = IceSanitizer::new(IcePolicy::Default);
        sanitizer.disable_ipv6 = true;
        sanitizer.disable_tcp = true;
        let output = sanitizer.sanitize(&all_candidates());
        assert!(output.iter().all(|l| !l.contains("2001:db8::7")));
        assert!(output.iter().all(|l| {
            IceCandidate::parse(l).map(|c| c.transport != "tcp").unwrap_or(false)
        }));
    }

    #[test]
    fn all_policy_is_a_passthrough() {
        let sanitizer = IceSanitizer::new(IcePolicy::All);
        let input = all_candidates();
        assert_eq!(sanitizer.sanitize(&input), input);
    }

    #[test]
    fn transport_disables_apply_even_under_passthrough_policy() {
        let mut sanitizer = IceSanitizer::new(IcePolicy::All);
        sanitizer.disable_tcp = true;
        let output = sanitizer.sanitize(&all_candidates());
        assert!(output.iter().all(|l| !l.contains(" tcp ")));
        // Everything else still passes untouched.
        assert!(output.contains(&HOST.to_string()));
        assert!(output.contains(&RELAY.to_string()));
    }
}
