//! Firewall rules for local listener admission
//!
//! Client-side listeners admit or drop inbound TCP connections based on an
//! ordered set of inclusive IPv4 ranges, or a wildcard. Rules are parsed
//! once from configuration and immutable afterwards; a malformed rule is a
//! configuration error, never a runtime one.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Firewall rule parse errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FirewallError {
    #[error("invalid IP address in rule '{0}'")]
    InvalidAddress(String),

    #[error("invalid range '{0}': start is greater than end")]
    InvertedRange(String),
}

/// One inclusive IPv4 range; a single address is a degenerate range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl IpRange {
    /// Parse `"a.b.c.d"` or `"a.b.c.d-e.f.g.h"`
    fn parse(s: &str) -> Result<Self, FirewallError> {
        let (start_str, end_str) = match s.split_once('-') {
            Some((start, end)) => (start.trim(), end.trim()),
            None => (s.trim(), s.trim()),
        };

        let start = Ipv4Addr::from_str(start_str)
            .map_err(|_| FirewallError::InvalidAddress(s.to_string()))?;
        let end = Ipv4Addr::from_str(end_str)
            .map_err(|_| FirewallError::InvalidAddress(s.to_string()))?;

        if u32::from(start) > u32::from(end) {
            return Err(FirewallError::InvertedRange(s.to_string()));
        }

        Ok(Self { start, end })
    }

    fn contains(&self, ip: &Ipv4Addr) -> bool {
        let bits = u32::from(*ip);
        u32::from(self.start) <= bits && bits <= u32::from(self.end)
    }
}

/// Immutable admission rules for one local listener
///
/// An empty rule set, or any entry equal to `*`, admits every source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FirewallRules {
    entries: Vec<String>,
    #[serde(skip)]
    allow_all: bool,
    #[serde(skip)]
    ranges: Vec<IpRange>,
}

impl FirewallRules {
    /// Admit everything (no configured rules)
    pub fn allow_all() -> Self {
        Self {
            entries: vec!["*".to_string()],
            allow_all: true,
            ranges: Vec::new(),
        }
    }

    /// Parse rules from configuration entries
    pub fn parse(entries: &[String]) -> Result<Self, FirewallError> {
        let mut allow_all = entries.is_empty();
        let mut ranges = Vec::with_capacity(entries.len());

        for entry in entries {
            if entry.trim() == "*" {
                allow_all = true;
                continue;
            }
            ranges.push(IpRange::parse(entry)?);
        }

        Ok(Self {
            entries: entries.to_vec(),
            allow_all,
            ranges,
        })
    }

    /// Check whether a source address is admitted.
    ///
    /// Non-IPv4 sources (including IPv4-mapped IPv6) match only the
    /// wildcard unless their mapped IPv4 form falls in a range.
    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        if self.allow_all {
            return true;
        }
        let v4 = match ip {
            IpAddr::V4(v4) => *v4,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4,
                None => return false,
            },
        };
        self.ranges.iter().any(|range| range.contains(&v4))
    }

    /// Check whether a socket address's source IP is admitted
    pub fn is_socket_allowed(&self, addr: &SocketAddr) -> bool {
        self.is_allowed(&addr.ip())
    }

    /// Rebuild the parsed ranges after deserialization
    pub fn init(&mut self) -> Result<(), FirewallError> {
        let rebuilt = Self::parse(&self.entries)?;
        self.allow_all = rebuilt.allow_all;
        self.ranges = rebuilt.ranges;
        Ok(())
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn rules(entries: &[&str]) -> FirewallRules {
        FirewallRules::parse(&entries.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_range_admission() {
        let rules = rules(&["10.0.0.1-10.0.0.50"]);
        assert!(rules.is_allowed(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 25))));
        assert!(rules.is_allowed(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(rules.is_allowed(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 50))));
        assert!(!rules.is_allowed(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 51))));
        assert!(!rules.is_allowed(&IpAddr::V4(Ipv4Addr::new(10, 0, 1, 25))));
    }

    #[test]
    fn test_wildcard_admits_everything() {
        let rules = rules(&["*"]);
        assert!(rules.is_allowed(&IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))));
        assert!(rules.is_allowed(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn test_empty_rules_admit_everything() {
        let rules = FirewallRules::parse(&[]).unwrap();
        assert!(rules.is_allowed(&IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))));
    }

    #[test]
    fn test_single_address_rule() {
        let rules = rules(&["192.168.1.100"]);
        assert!(rules.is_allowed(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100))));
        assert!(!rules.is_allowed(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 101))));
    }

    #[test]
    fn test_multiple_rules() {
        let rules = rules(&["10.0.0.1-10.0.0.50", "192.168.1.1"]);
        assert!(rules.is_allowed(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 30))));
        assert!(rules.is_allowed(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert!(!rules.is_allowed(&IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))));
    }

    #[test]
    fn test_ipv6_rejected_without_wildcard() {
        let rules = rules(&["10.0.0.0-10.255.255.255"]);
        assert!(!rules.is_allowed(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn test_ipv4_mapped_ipv6_matches_range() {
        let rules = rules(&["10.0.0.1-10.0.0.50"]);
        let mapped = Ipv4Addr::new(10, 0, 0, 25).to_ipv6_mapped();
        assert!(rules.is_allowed(&IpAddr::V6(mapped)));
    }

    #[test]
    fn test_invalid_address() {
        let result = FirewallRules::parse(&["not-an-ip".to_string()]);
        assert!(matches!(result, Err(FirewallError::InvalidAddress(_))));
    }

    #[test]
    fn test_inverted_range() {
        let result = FirewallRules::parse(&["10.0.0.50-10.0.0.1".to_string()]);
        assert!(matches!(result, Err(FirewallError::InvertedRange(_))));
    }

    #[test]
    fn test_socket_addr_admission() {
        let rules = rules(&["10.0.0.1-10.0.0.50"]);
        let allowed: SocketAddr = "10.0.0.25:5021".parse().unwrap();
        let denied: SocketAddr = "10.0.0.51:5021".parse().unwrap();
        assert!(rules.is_socket_allowed(&allowed));
        assert!(!rules.is_socket_allowed(&denied));
    }

    #[test]
    fn test_init_after_deserialization() {
        let rules = rules(&["10.0.0.1-10.0.0.50"]);
        let json = serde_json::to_string(&rules).unwrap();
        let mut restored: FirewallRules = serde_json::from_str(&json).unwrap();
        restored.init().unwrap();
        assert!(restored.is_allowed(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 25))));
        assert!(!restored.is_allowed(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 51))));
    }
}
