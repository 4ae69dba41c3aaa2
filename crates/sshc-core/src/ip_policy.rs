//! IP Policy
//!
//! Parses and normalizes per-instance source-IP allow lists (bare IPs and
//! CIDRs, v4 and v6) and evaluates membership.

use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IpPolicyError {
    #[error("invalid allow-list entry: {0:?}")]
    InvalidEntry(String),

    #[error("source IP denied: bad_source")]
    BadSource,

    #[error("source IP denied: not in allow list")]
    NotAllowed,
}

/// Parse a comma-separated allow-list string into CIDR networks. Bare IPs
/// become `/32` (v4) or `/128` (v6). Whitespace around entries is trimmed
/// and empty entries are skipped. An empty (or all-empty) input means
/// "allow all" and parses to an empty list. Any unparseable entry fails the
/// whole parse.
pub fn parse(s: &str) -> Result<Vec<IpNet>, IpPolicyError> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_entry)
        .collect()
}

fn parse_entry(entry: &str) -> Result<IpNet, IpPolicyError> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    if let Ok(addr) = entry.parse::<IpAddr>() {
        let prefix_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        return IpNet::new(addr, prefix_len)
            .map_err(|_| IpPolicyError::InvalidEntry(entry.to_string()));
    }
    Err(IpPolicyError::InvalidEntry(entry.to_string()))
}

/// Re-emit the allow-list string in canonical form: same entry order,
/// single space after each comma, CIDRs truncated to their network address
/// (`10.0.0.5/24` -> `10.0.0.0/24`).
pub fn normalize(s: &str) -> Result<String, IpPolicyError> {
    let networks = parse(s)?;
    Ok(networks
        .iter()
        .map(|net| net.trunc().to_string())
        .collect::<Vec<_>>()
        .join(", "))
}

/// Check whether `source_ip` is allowed by `allow_list_string`. An empty
/// list allows everything. A source IP that fails to parse is denied with
/// `BadSource`.
pub fn check(source_ip: &str, allow_list_string: &str) -> Result<(), IpPolicyError> {
    let networks = parse(allow_list_string)?;
    if networks.is_empty() {
        return Ok(());
    }

    let addr: IpAddr = source_ip.parse().map_err(|_| IpPolicyError::BadSource)?;
    if networks.iter().any(|net| net.contains(&addr)) {
        Ok(())
    } else {
        Err(IpPolicyError::NotAllowed)
    }
}

/// Convenience wrapper bundling a parsed allow list with its canonical
/// source string, used by the SSH Manager to avoid re-parsing on every
/// `Connect`.
#[derive(Debug, Clone, Default)]
pub struct IpPolicy {
    networks: Vec<IpNet>,
}

impl IpPolicy {
    pub fn parse(allow_list_string: &str) -> Result<Self, IpPolicyError> {
        Ok(Self {
            networks: parse(allow_list_string)?,
        })
    }

    pub fn allows(&self, source_ip: IpAddr) -> bool {
        self.networks.is_empty() || self.networks.iter().any(|net| net.contains(&source_ip))
    }

    pub fn is_allow_all(&self) -> bool {
        self.networks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_allows_all() {
        let networks = parse("").unwrap();
        assert!(networks.is_empty());
        assert!(check("203.0.113.5", "").is_ok());
    }

    #[test]
    fn bare_ipv4_becomes_slash_32() {
        let networks = parse("10.0.0.5").unwrap();
        assert_eq!(networks[0].prefix_len(), 32);
    }

    #[test]
    fn bare_ipv6_becomes_slash_128() {
        let networks = parse("::1").unwrap();
        assert_eq!(networks[0].prefix_len(), 128);
    }

    #[test]
    fn cidr_normalizes_to_network_address() {
        let normalized = normalize("10.0.0.5/24").unwrap();
        assert_eq!(normalized, "10.0.0.0/24");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize("10.0.0.5/24, 192.168.1.1").unwrap();
        let twice = normalize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn parse_of_normalize_has_same_networks() {
        let original = "10.0.0.5/24,  192.168.1.1 ,::1";
        let a = parse(original).unwrap();
        let b = parse(&normalize(original).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_entry_fails_whole_parse() {
        assert!(parse("10.0.0.1, not-an-ip").is_err());
    }

    #[test]
    fn check_allows_member_and_denies_non_member() {
        assert!(check("10.0.0.42", "10.0.0.0/24").is_ok());
        assert!(check("10.0.1.42", "10.0.0.0/24").is_err());
    }

    #[test]
    fn check_bad_source_is_denied() {
        let err = check("not-an-ip", "10.0.0.0/24").unwrap_err();
        assert_eq!(err, IpPolicyError::BadSource);
    }
}
