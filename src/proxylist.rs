//! Upstream candidate list parsing (C2): turns a static `host:port,…` config
//! value or a PAC script's return string into an ordered, deduplicated list
//! of [`Upstream`] entries.

use std::fmt;

use tracing::warn;

use crate::error::PxError;

/// One candidate upstream, or the sentinel meaning "connect to the target
/// directly, no proxy in the path."
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Upstream {
    Proxy { host: String, port: u16 },
    Direct,
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Upstream::Proxy { host, port } => write!(f, "{host}:{port}"),
            Upstream::Direct => write!(f, "DIRECT"),
        }
    }
}

const DEFAULT_PORT: u16 = 80;

/// Parses `--server`-style config: `host:port,host2:port2,…`. Bare `host`
/// entries (no port) default to port 80. Unlike [`parse_pac_return`], there
/// is no `PROXY`/`DIRECT` keyword here — every entry is a proxy.
pub fn parse_static_list(value: &str) -> Vec<Upstream> {
    dedup(value.split(',').filter_map(|entry| parse_host_port(entry.trim())))
}

/// Parses a PAC `FindProxyForURL` return value: a semicolon-separated list
/// of `PROXY host:port` and/or `DIRECT` tokens. `SOCKS host:port` entries
/// are treated the same as `PROXY` (Px does not distinguish SOCKS, but a
/// PAC script may still emit the keyword).
pub fn parse_pac_return(value: &str) -> Vec<Upstream> {
    dedup(value.split(';').filter_map(|token| {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        if token.eq_ignore_ascii_case("DIRECT") {
            return Some(Upstream::Direct);
        }
        let rest = token
            .strip_prefix("PROXY")
            .or_else(|| token.strip_prefix("proxy"))
            .or_else(|| token.strip_prefix("SOCKS"))
            .or_else(|| token.strip_prefix("socks"))?;
        parse_host_port(rest.trim())
    }))
}

fn parse_host_port(entry: &str) -> Option<Upstream> {
    if entry.is_empty() {
        return None;
    }

    if let Some(rest) = entry.strip_prefix('[') {
        return match rest.find(']') {
            Some(bracket_end) => {
                let host = &rest[..bracket_end];
                let after = &rest[bracket_end + 1..];
                let port = after
                    .strip_prefix(':')
                    .and_then(|p| p.parse::<u16>().ok())
                    .unwrap_or(DEFAULT_PORT);
                Some(Upstream::Proxy {
                    host: host.to_string(),
                    port,
                })
            }
            None => {
                let err = PxError::InvalidUpstreamEntry { entry: entry.to_string() };
                warn!(error = %err, "proxylist: skipping malformed upstream entry");
                None
            }
        };
    }

    // Only treat the text after the last colon as a port when it's
    // actually digits; an unparseable-as-port suffix that still looks
    // like one (all digits, just out of u16 range) is rejected rather
    // than silently folded back into the hostname.
    match entry.rsplit_once(':') {
        Some((host, port_str)) if !port_str.is_empty() && port_str.bytes().all(|b| b.is_ascii_digit()) => {
            match port_str.parse::<u16>() {
                Ok(port) => Some(Upstream::Proxy {
                    host: host.to_string(),
                    port,
                }),
                Err(_) => {
                    let err = PxError::InvalidUpstreamEntry { entry: entry.to_string() };
                    warn!(error = %err, "proxylist: skipping malformed upstream entry");
                    None
                }
            }
        }
        _ => Some(Upstream::Proxy {
            host: entry.to_string(),
            port: DEFAULT_PORT,
        }),
    }
}

fn dedup(iter: impl Iterator<Item = Upstream>) -> Vec<Upstream> {
    let mut seen = Vec::new();
    for item in iter {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_list_defaults_port_80() {
        let list = parse_static_list("up.corp:8080,fallback.corp");
        assert_eq!(
            list,
            vec![
                Upstream::Proxy { host: "up.corp".into(), port: 8080 },
                Upstream::Proxy { host: "fallback.corp".into(), port: 80 },
            ]
        );
    }

    #[test]
    fn static_list_dedups_preserving_first_occurrence() {
        let list = parse_static_list("a:1,b:2,a:1");
        assert_eq!(
            list,
            vec![
                Upstream::Proxy { host: "a".into(), port: 1 },
                Upstream::Proxy { host: "b".into(), port: 2 },
            ]
        );
    }

    #[test]
    fn pac_return_mixed_proxy_and_direct() {
        let list = parse_pac_return("PROXY a:1; PROXY b:2; DIRECT");
        assert_eq!(
            list,
            vec![
                Upstream::Proxy { host: "a".into(), port: 1 },
                Upstream::Proxy { host: "b".into(), port: 2 },
                Upstream::Direct,
            ]
        );
    }

    #[test]
    fn pac_return_direct_only() {
        assert_eq!(parse_pac_return("DIRECT"), vec![Upstream::Direct]);
    }

    #[test]
    fn pac_return_ipv6_bracket_host() {
        let list = parse_pac_return("PROXY [::1]:8080");
        assert_eq!(
            list,
            vec![Upstream::Proxy { host: "::1".into(), port: 8080 }]
        );
    }

    #[test]
    fn empty_input_yields_empty_list() {
        assert!(parse_static_list("").is_empty());
    }

    #[test]
    fn malformed_entries_are_skipped_not_fatal() {
        let list = parse_static_list("[::1,good:80,bad:999999");
        assert_eq!(list, vec![Upstream::Proxy { host: "good".into(), port: 80 }]);
    }
}
