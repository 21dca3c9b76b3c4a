//! Dual-stack address negotiation between node pairs
//!
//! A node is addressable over a family iff its explicit field for that
//! family is set, or (with neither explicit field set) its legacy address
//! parses as that family. Legacy addresses that are hostnames count as both.

use crate::error::DualStackError;
use portlink_db::entities::node;
use std::net::IpAddr;

/// Address-family preference of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpPreference {
    #[default]
    Auto,
    V4,
    V6,
}

impl IpPreference {
    pub fn parse(raw: &str) -> IpPreference {
        match raw.trim() {
            "v4" => IpPreference::V4,
            "v6" => IpPreference::V6,
            _ => IpPreference::Auto,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IpPreference::Auto => "",
            IpPreference::V4 => "v4",
            IpPreference::V6 => "v6",
        }
    }
}

pub fn supports_v4(node: &node::Model) -> bool {
    if trimmed(&node.server_addr_v4).is_some() {
        return true;
    }
    if trimmed(&node.server_addr_v6).is_some() {
        return false;
    }
    legacy_family(node).map_or(false, |(v4, _)| v4)
}

pub fn supports_v6(node: &node::Model) -> bool {
    if trimmed(&node.server_addr_v6).is_some() {
        return true;
    }
    if trimmed(&node.server_addr_v4).is_some() {
        return false;
    }
    legacy_family(node).map_or(false, |(_, v6)| v6)
}

/// Pick the address `from` must dial to reach `to`, honoring the preference.
/// A family is usable only when both nodes support it. The returned host is
/// stripped of IPv6 brackets; re-bracket with [`format_host_port`] when
/// joining it with a port.
pub fn select_dial_host(
    from: &node::Model,
    to: &node::Model,
    preference: IpPreference,
) -> Result<String, DualStackError> {
    let from_v4 = supports_v4(from);
    let from_v6 = supports_v6(from);
    let to_v4 = supports_v4(to);
    let to_v6 = supports_v6(to);

    let order: [(bool, fn(&node::Model) -> String); 2] = match preference {
        IpPreference::V6 => [(from_v6 && to_v6, address_v6), (from_v4 && to_v4, address_v4)],
        // auto behaves as prefer-v4
        IpPreference::V4 | IpPreference::Auto => {
            [(from_v4 && to_v4, address_v4), (from_v6 && to_v6, address_v6)]
        }
    };

    for (usable, pick) in order {
        if usable {
            let host = pick(to);
            if !host.is_empty() {
                return Ok(host);
            }
        }
    }

    Err(DualStackError {
        from_name: from.display_name(),
        from_v4,
        from_v6,
        to_name: to.display_name(),
        to_v4,
        to_v6,
    })
}

/// Join host and port, bracketing bare IPv6 hosts.
pub fn format_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if looks_like_ipv6(host) && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Re-bracket the host part of an already-joined `host:port` address.
pub fn normalize_host_port(addr: &str) -> String {
    let addr = addr.trim();
    if addr.is_empty() || addr.starts_with('[') {
        return addr.to_string();
    }
    let Some(idx) = addr.rfind(':') else {
        if looks_like_ipv6(addr) {
            return format!("[{addr}]");
        }
        return addr.to_string();
    };
    let (host, port) = (addr[..idx].trim(), addr[idx + 1..].trim());
    if host.is_empty() || port.is_empty() {
        return addr.to_string();
    }
    if looks_like_ipv6(host) {
        return format!("[{host}]:{port}");
    }
    addr.to_string()
}

pub fn strip_brackets(host: &str) -> &str {
    host.trim().trim_start_matches('[').trim_end_matches(']')
}

fn looks_like_ipv6(address: &str) -> bool {
    address.matches(':').count() >= 2
}

fn address_v4(node: &node::Model) -> String {
    trimmed(&node.server_addr_v4)
        .unwrap_or_else(|| strip_brackets(&node.server_addr).to_string())
}

fn address_v6(node: &node::Model) -> String {
    trimmed(&node.server_addr_v6)
        .unwrap_or_else(|| strip_brackets(&node.server_addr).to_string())
}

fn trimmed(field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| strip_brackets(s).to_string())
}

/// (v4, v6) capability derived from the legacy address. Hostnames count as
/// both families.
fn legacy_family(node: &node::Model) -> Option<(bool, bool)> {
    let legacy = strip_brackets(&node.server_addr);
    if legacy.is_empty() {
        return None;
    }
    match legacy.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => Some((true, false)),
        Ok(IpAddr::V6(_)) => Some((false, true)),
        Err(_) => Some((true, true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_node(legacy: &str, v4: Option<&str>, v6: Option<&str>) -> node::Model {
        let now = Utc::now();
        node::Model {
            id: 0,
            name: "n".to_string(),
            secret: String::new(),
            server_addr: legacy.to_string(),
            server_addr_v4: v4.map(str::to_string),
            server_addr_v6: v6.map(str::to_string),
            port_range: String::new(),
            tcp_listen_addr: "[::]".to_string(),
            udp_listen_addr: "[::]".to_string(),
            interface_name: None,
            version: None,
            http: 0,
            tls: 0,
            socks: 0,
            status: 1,
            is_remote: false,
            remote_url: None,
            remote_token: None,
            remote_config: None,
            sort_index: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn explicit_fields_decide_capability() {
        let v4_only = test_node("", Some("10.0.0.1"), None);
        assert!(supports_v4(&v4_only));
        assert!(!supports_v6(&v4_only));

        let v6_only = test_node("", None, Some("2001:db8::1"));
        assert!(!supports_v4(&v6_only));
        assert!(supports_v6(&v6_only));

        let dual = test_node("", Some("10.0.0.1"), Some("2001:db8::1"));
        assert!(supports_v4(&dual));
        assert!(supports_v6(&dual));
    }

    #[test]
    fn legacy_address_family_is_the_fallback() {
        let legacy_v4 = test_node("192.168.1.1", None, None);
        assert!(supports_v4(&legacy_v4));
        assert!(!supports_v6(&legacy_v4));

        let legacy_v6 = test_node("2001:db8::1", None, None);
        assert!(!supports_v4(&legacy_v6));
        assert!(supports_v6(&legacy_v6));

        let bracketed = test_node("[::1]", None, None);
        assert!(!supports_v4(&bracketed));
        assert!(supports_v6(&bracketed));

        let hostname = test_node("relay.example.com", None, None);
        assert!(supports_v4(&hostname));
        assert!(supports_v6(&hostname));

        let empty = test_node("", None, None);
        assert!(!supports_v4(&empty));
        assert!(!supports_v6(&empty));
    }

    #[test]
    fn dual_stack_pair_honors_preference() {
        let a = test_node("", Some("10.0.0.1"), Some("2001:db8::1"));
        let b = test_node("", Some("10.0.0.2"), Some("2001:db8::2"));

        assert_eq!(select_dial_host(&a, &b, IpPreference::V6).unwrap(), "2001:db8::2");
        assert_eq!(select_dial_host(&a, &b, IpPreference::V4).unwrap(), "10.0.0.2");
        assert_eq!(select_dial_host(&a, &b, IpPreference::Auto).unwrap(), "10.0.0.2");
    }

    #[test]
    fn preference_falls_back_to_the_shared_family() {
        let v4_only = test_node("", Some("10.0.0.1"), None);
        let dual = test_node("", Some("10.0.0.2"), Some("2001:db8::2"));

        // prefer-v6 but only v4 is common
        assert_eq!(
            select_dial_host(&v4_only, &dual, IpPreference::V6).unwrap(),
            "10.0.0.2"
        );
    }

    #[test]
    fn incompatible_pair_fails_for_every_preference() {
        let v4_only = test_node("", Some("10.0.0.1"), None);
        let v6_only = test_node("", None, Some("2001:db8::1"));

        for pref in [IpPreference::Auto, IpPreference::V4, IpPreference::V6] {
            let err = select_dial_host(&v4_only, &v6_only, pref).unwrap_err();
            assert!(err.to_string().contains("no common address family"));
        }
    }

    #[test]
    fn returned_v6_host_is_unbracketed_and_rebracketed_on_join() {
        let a = test_node("", None, Some("2001:db8::1"));
        let b = test_node("[2001:db8::2]", None, None);

        let host = select_dial_host(&a, &b, IpPreference::V6).unwrap();
        assert_eq!(host, "2001:db8::2");
        assert_eq!(format_host_port(&host, 41000), "[2001:db8::2]:41000");
        assert_eq!(format_host_port("10.0.0.2", 41000), "10.0.0.2:41000");
    }

    #[test]
    fn normalize_host_port_brackets_joined_v6() {
        assert_eq!(normalize_host_port("2001:db8::1:8080"), "[2001:db8::1]:8080");
        assert_eq!(normalize_host_port("[2001:db8::1]:8080"), "[2001:db8::1]:8080");
        assert_eq!(normalize_host_port("10.0.0.1:8080"), "10.0.0.1:8080");
        assert_eq!(normalize_host_port("example.com:443"), "example.com:443");
    }
}
