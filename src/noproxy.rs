//! Host/IP bypass matching (C1): decides whether a request should skip the
//! upstream proxy entirely and go direct.
//!
//! The rule string is richer than a plain hostname allow-list (it also
//! carries CIDR/range/dotted-wildcard IP rules), so matching is split into
//! a host-pattern table and an IP-range table that are each tried in turn.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

use tracing::warn;

use crate::error::PxError;

/// One parsed entry of the `ip_ranges` table.
#[derive(Debug, Clone)]
enum IpRule {
    Cidr(IpNet),
    Single(IpAddr),
    /// `192.168.*.*`: each field of `pattern` is either a fixed octet or
    /// `None` for `*`.
    DottedWildcard([Option<u8>; 4]),
    Range(IpAddr, IpAddr),
}

impl IpRule {
    fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            IpRule::Cidr(net) => net.contains(ip),
            IpRule::Single(addr) => addr == ip,
            IpRule::DottedWildcard(pattern) => match ip {
                IpAddr::V4(v4) => {
                    let octets = v4.octets();
                    pattern
                        .iter()
                        .zip(octets.iter())
                        .all(|(want, have)| want.map(|w| w == *have).unwrap_or(true))
                }
                IpAddr::V6(_) => false,
            },
            IpRule::Range(lo, hi) => match (lo, hi, ip) {
                (IpAddr::V4(lo), IpAddr::V4(hi), IpAddr::V4(ip)) => {
                    u32::from(*ip) >= u32::from(*lo) && u32::from(*ip) <= u32::from(*hi)
                }
                (IpAddr::V6(lo), IpAddr::V6(hi), IpAddr::V6(ip)) => {
                    u128::from(*ip) >= u128::from(*lo) && u128::from(*ip) <= u128::from(*hi)
                }
                _ => false,
            },
        }
    }
}

/// A host pattern: exact hostname, `*.suffix` wildcard, or bare-suffix
/// (`.example.com` matching `example.com` and any subdomain).
#[derive(Debug, Clone)]
enum HostRule {
    Exact(String),
    WildcardSuffix(String),
    BareSuffix(String),
}

/// Parsed, immutable bypass rule set. Built once at config-load time from a
/// comma-separated rule string; `NoProxy::matches` never mutates state, so
/// it is safe to share behind an `Arc` across worker threads.
#[derive(Debug, Clone, Default)]
pub struct NoProxy {
    host_patterns: Vec<HostRule>,
    ip_ranges: Vec<IpRule>,
}

impl NoProxy {
    /// Parse a comma-separated rule string. Malformed entries are rejected
    /// individually and logged once; the remaining rules still apply.
    pub fn parse(rules: &str) -> Self {
        let mut host_patterns = Vec::new();
        let mut ip_ranges = Vec::new();

        for raw in rules.split(',') {
            let entry = raw.trim();
            if entry.is_empty() {
                continue;
            }

            if let Some(rule) = parse_ip_rule(entry) {
                ip_ranges.push(rule);
                continue;
            }

            if looks_like_ip_rule(entry) {
                let err = PxError::NoProxyRule {
                    rule: entry.to_string(),
                    reason: "not a valid CIDR, IP, range or dotted-wildcard pattern".to_string(),
                };
                warn!(error = %err, "noproxy: skipping malformed rule");
                continue;
            }

            host_patterns.push(parse_host_rule(&entry.to_ascii_lowercase()));
        }

        Self {
            host_patterns,
            ip_ranges,
        }
    }

    /// True if `host_or_ip` should bypass the upstream proxy.
    ///
    /// Loopback addresses and the `localhost` name always bypass,
    /// independent of the configured rule set.
    pub fn matches(&self, host_or_ip: &str) -> bool {
        let stripped = strip_brackets(host_or_ip).to_ascii_lowercase();

        if let Ok(ip) = IpAddr::from_str(&stripped) {
            if ip.is_loopback() {
                return true;
            }
            return self.ip_ranges.iter().any(|rule| rule.contains(&ip));
        }

        if stripped == "localhost" {
            return true;
        }

        self.host_patterns.iter().any(|rule| match rule {
            HostRule::Exact(pat) => &stripped == pat,
            HostRule::WildcardSuffix(suffix) => stripped.ends_with(suffix.as_str()),
            HostRule::BareSuffix(suffix) => {
                &stripped == suffix || stripped.ends_with(&format!(".{suffix}"))
            }
        })
    }

    /// Hostnames only (no IP rules), joined for passing to C5's `no_proxy`
    /// CSV parameter — IPs are pre-filtered here since the underlying HTTP
    /// client only understands CIDR, not wildcards/ranges.
    pub fn host_rules_csv(&self) -> String {
        self.host_patterns
            .iter()
            .map(|rule| match rule {
                HostRule::Exact(s) => s.clone(),
                HostRule::WildcardSuffix(s) => format!("*{s}"),
                HostRule::BareSuffix(s) => format!(".{s}"),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(host)
}

fn parse_host_rule(host: &str) -> HostRule {
    if let Some(suffix) = host.strip_prefix("*.") {
        HostRule::WildcardSuffix(format!(".{suffix}"))
    } else if let Some(suffix) = host.strip_prefix('.') {
        HostRule::BareSuffix(suffix.to_string())
    } else {
        HostRule::Exact(host.to_string())
    }
}

fn looks_like_ip_rule(entry: &str) -> bool {
    entry.contains('/') || entry.contains('-') || entry.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn parse_ip_rule(entry: &str) -> Option<IpRule> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Some(IpRule::Cidr(net));
    }

    if let Ok(addr) = entry.parse::<IpAddr>() {
        return Some(IpRule::Single(addr));
    }

    if let Some((lo, hi)) = entry.split_once('-') {
        if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<IpAddr>(), hi.trim().parse::<IpAddr>()) {
            return Some(IpRule::Range(lo, hi));
        }
    }

    if entry.contains('*') && entry.matches('.').count() == 3 {
        let mut pattern = [None; 4];
        for (i, part) in entry.split('.').enumerate() {
            if i >= 4 {
                return None;
            }
            if part == "*" {
                pattern[i] = None;
            } else {
                pattern[i] = Some(part.parse::<u8>().ok()?);
            }
        }
        return Some(IpRule::DottedWildcard(pattern));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_wildcard_host_rules() {
        let rules = NoProxy::parse("example.com,*.internal.corp");
        assert!(rules.matches("example.com"));
        assert!(!rules.matches("sub.example.com"));
        assert!(rules.matches("a.internal.corp"));
        assert!(!rules.matches("internal.corp"));
    }

    #[test]
    fn bare_suffix_matches_domain_and_subdomains_only() {
        let rules = NoProxy::parse(".example.com");
        assert!(rules.matches("a.example.com"));
        assert!(rules.matches("example.com"));
        assert!(!rules.matches("notexample.com"));
    }

    #[test]
    fn dotted_wildcard_ipv4() {
        let rules = NoProxy::parse("10.0.*.*");
        assert!(rules.matches("10.0.255.1"));
        assert!(!rules.matches("10.1.0.1"));
    }

    #[test]
    fn cidr_and_range() {
        let rules = NoProxy::parse("192.168.1.0/24,172.16.0.1-172.16.0.64");
        assert!(rules.matches("192.168.1.200"));
        assert!(!rules.matches("192.168.2.1"));
        assert!(rules.matches("172.16.0.32"));
        assert!(!rules.matches("172.16.0.65"));
    }

    #[test]
    fn loopback_always_bypasses() {
        let rules = NoProxy::parse("");
        assert!(rules.matches("127.0.0.1"));
        assert!(rules.matches("localhost"));
        assert!(rules.matches("::1"));
    }

    #[test]
    fn malformed_cidr_is_skipped_not_fatal() {
        let rules = NoProxy::parse("10.0.0.0/99,example.com");
        assert!(rules.matches("example.com"));
        assert!(!rules.matches("10.0.0.5"));
    }

    #[test]
    fn ipv6_bracket_form_is_stripped() {
        let rules = NoProxy::parse("::1/128");
        assert!(rules.matches("[::1]"));
    }
}
