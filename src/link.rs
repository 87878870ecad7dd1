//! Link and supplier information derived from a data call.

use std::net::IpAddr;

use crate::config::DEFAULT_MTU;
use crate::types::SetupDataCallResult;

pub const IP_TYPE_IPV4: &str = "IPV4";
pub const IP_TYPE_IPV6: &str = "IPV6";
pub const IP_TYPE_IPV4V6: &str = "IPV4V6";

/// Supplier score of the default data slot's connections.
pub const DEFAULT_SLOT_SCORE: i32 = 60;
/// Supplier score of every other slot, so the platform prefers the default.
pub const OTHER_SLOT_SCORE: i32 = 55;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    V4,
    V6,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddressInfo {
    pub address: String,
    pub family: AddressFamily,
    pub prefix_len: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteInfo {
    pub iface: String,
    pub destination: AddressInfo,
    pub gateway: AddressInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpProxy {
    pub host: String,
    pub port: u16,
}

/// Link details pushed to the platform for an available connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetLinkInfo {
    pub iface_name: String,
    pub addresses: Vec<AddressInfo>,
    pub dns: Vec<AddressInfo>,
    pub routes: Vec<RouteInfo>,
    pub mtu: u32,
    pub tcp_buffer_sizes: String,
    pub ident: String,
    pub http_proxy: Option<HttpProxy>,
}

impl NetLinkInfo {
    pub fn ip_type(&self) -> &'static str {
        ip_type_of(&self.addresses)
    }
}

/// Availability and quality of a supplier.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetSupplierInfo {
    pub is_available: bool,
    pub is_roaming: bool,
    pub strength: i32,
    pub score: i32,
    pub link_up_bandwidth_kbps: u32,
    pub link_down_bandwidth_kbps: u32,
}

/// Parse one `address[/prefix]` token. Without a prefix the full host
/// length is assumed.
pub fn parse_address(token: &str) -> Option<AddressInfo> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    let (addr, prefix) = match token.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (token, None),
    };
    let ip: IpAddr = match addr.parse() {
        Ok(ip) => ip,
        Err(_) => {
            warn!("Unparsable address token {:?}", token);
            return None;
        }
    };
    let (family, max_prefix) = match ip {
        IpAddr::V4(_) => (AddressFamily::V4, 32),
        IpAddr::V6(_) => (AddressFamily::V6, 128),
    };
    let prefix_len = match prefix {
        Some(p) => match p.parse::<u8>() {
            Ok(len) if len <= max_prefix => len,
            _ => {
                warn!("Bad prefix length in {:?}", token);
                return None;
            }
        },
        None => max_prefix,
    };
    Some(AddressInfo {
        address: ip.to_string(),
        family,
        prefix_len,
    })
}

/// Parse a space separated address list, dropping malformed tokens.
pub fn parse_address_list(list: &str) -> Vec<AddressInfo> {
    list.split_whitespace().filter_map(parse_address).collect()
}

/// Composite IP type of an address list: `IPV4`, `IPV6`, `IPV4V6` or empty.
pub fn ip_type_of(addresses: &[AddressInfo]) -> &'static str {
    let v4 = addresses.iter().any(|a| a.family == AddressFamily::V4);
    let v6 = addresses.iter().any(|a| a.family == AddressFamily::V6);
    match (v4, v6) {
        (true, true) => IP_TYPE_IPV4V6,
        (true, false) => IP_TYPE_IPV4,
        (false, true) => IP_TYPE_IPV6,
        (false, false) => "",
    }
}

/// Default routes through each gateway, matched to address families present.
pub fn gateway_routes(iface: &str, gateways: &[AddressInfo]) -> Vec<RouteInfo> {
    gateways
        .iter()
        .filter(|gw| gw.family != AddressFamily::Unknown)
        .map(|gw| {
            let destination = match gw.family {
                AddressFamily::V6 => AddressInfo {
                    address: "::".into(),
                    family: AddressFamily::V6,
                    prefix_len: 0,
                },
                _ => AddressInfo {
                    address: "0.0.0.0".into(),
                    family: AddressFamily::V4,
                    prefix_len: 0,
                },
            };
            RouteInfo {
                iface: iface.into(),
                destination,
                gateway: gw.clone(),
            }
        })
        .collect()
}

/// Apply an operator MTU override keyed by IP type.
///
/// The first malformed entry stops the scan and leaves `mtu` as it was.
pub fn apply_mtu_override(config: &str, ip_type: &str, mtu: &mut u32) {
    for entry in config.split(';') {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() != 2 || parts[0].trim().is_empty() || parts[1].trim().is_empty() {
            warn!("Invalid mtu config entry {:?}", entry);
            return;
        }
        let value = match parts[1].trim().parse::<u32>() {
            Ok(v) if v > 0 => v,
            _ => {
                warn!("Invalid mtu value {:?}", parts[1]);
                return;
            }
        };
        if parts[0].trim().eq_ignore_ascii_case(ip_type) {
            *mtu = value;
        }
    }
}

/// MTU of a call: reported value or the default, then the operator override.
pub fn resolve_mtu(result: &SetupDataCallResult, ip_type: &str, config: Option<&str>) -> u32 {
    let mut mtu = if result.mtu > 0 {
        result.mtu
    } else {
        DEFAULT_MTU
    };
    if let Some(config) = config {
        apply_mtu_override(config, ip_type, &mut mtu);
    }
    mtu
}

/// Split a `host[:port]` proxy string by colon count.
///
/// No colon is a bare host and exactly one colon is host and port, with a
/// non numeric port read as 0. Anything with more colons, a raw IPv6 literal
/// included, is kept whole as the host with port 0. Bracketed IPv6 with a
/// port is not recognised.
pub fn split_proxy_ip_address(proxy: &str) -> HttpProxy {
    let colons = proxy.matches(':').count();
    if colons == 1 {
        if let Some((host, port)) = proxy.split_once(':') {
            return HttpProxy {
                host: host.into(),
                port: port.trim().parse().unwrap_or(0),
            };
        }
    }
    HttpProxy {
        host: proxy.into(),
        port: 0,
    }
}

/// Supplier score for a slot given the current default data slot.
pub fn net_score_by_slot_id(slot_id: i32, default_slot_id: i32) -> i32 {
    if slot_id == default_slot_id {
        DEFAULT_SLOT_SCORE
    } else {
        OTHER_SLOT_SCORE
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ip_type_derivation() {
        let v4 = parse_address_list("10.0.0.2/8 192.168.1.1/24");
        let v6 = parse_address_list("2001:db8::1/64");
        let both = parse_address_list("10.0.0.2/8 2001:db8::1/64");
        assert_eq!(ip_type_of(&v4), IP_TYPE_IPV4);
        assert_eq!(ip_type_of(&v6), IP_TYPE_IPV6);
        assert_eq!(ip_type_of(&both), IP_TYPE_IPV4V6);
        assert_eq!(ip_type_of(&[]), "");

        let unknown = vec![AddressInfo {
            address: "x".into(),
            family: AddressFamily::Unknown,
            prefix_len: 0,
        }];
        assert_eq!(ip_type_of(&unknown), "");
    }

    #[test]
    fn address_tokens() {
        let addr = parse_address("192.168.1.1/24").unwrap();
        assert_eq!(addr.address, "192.168.1.1");
        assert_eq!(addr.prefix_len, 24);
        assert_eq!(addr.family, AddressFamily::V4);

        assert_eq!(parse_address("8.8.8.8").unwrap().prefix_len, 32);
        assert!(parse_address("300.1.1.1/24").is_none());
        assert!(parse_address("10.0.0.1/33").is_none());
        assert!(parse_address("").is_none());
        assert_eq!(parse_address_list("  garbage 10.1.1.1/16 ").len(), 1);
    }

    #[test]
    fn routes_follow_gateway_family() {
        let gws = parse_address_list("192.168.1.1 fe80::1");
        let routes = gateway_routes("rmnet0", &gws);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].destination.address, "0.0.0.0");
        assert_eq!(routes[1].destination.address, "::");
        assert_eq!(routes[1].iface, "rmnet0");
    }

    #[test]
    fn proxy_splitting() {
        assert_eq!(
            split_proxy_ip_address("1.2.3.4"),
            HttpProxy {
                host: "1.2.3.4".into(),
                port: 0
            }
        );
        assert_eq!(
            split_proxy_ip_address("1.2.3.4:8080"),
            HttpProxy {
                host: "1.2.3.4".into(),
                port: 8080
            }
        );
        assert_eq!(split_proxy_ip_address(""), HttpProxy::default());
        assert_eq!(split_proxy_ip_address("proxy:http").port, 0);
        assert_eq!(split_proxy_ip_address("proxy:http").host, "proxy");
    }

    #[test]
    fn proxy_with_many_colons_is_host_only() {
        // Raw and bracketed IPv6 literals are taken verbatim, port included.
        let raw = split_proxy_ip_address("2001:db8::1");
        assert_eq!(raw.host, "2001:db8::1");
        assert_eq!(raw.port, 0);

        let bracketed = split_proxy_ip_address("[2001:db8::1]:8080");
        assert_eq!(bracketed.host, "[2001:db8::1]:8080");
        assert_eq!(bracketed.port, 0);
    }

    #[test]
    fn score_prefers_default_slot() {
        for default_slot in 0..2 {
            for slot in 0..2 {
                let expected = if slot == default_slot { 60 } else { 55 };
                assert_eq!(net_score_by_slot_id(slot, default_slot), expected);
            }
        }
    }

    #[test]
    fn mtu_override() {
        let result = SetupDataCallResult {
            mtu: 1400,
            ..Default::default()
        };
        assert_eq!(resolve_mtu(&result, IP_TYPE_IPV4, None), 1400);
        assert_eq!(
            resolve_mtu(&SetupDataCallResult::default(), IP_TYPE_IPV4, None),
            DEFAULT_MTU
        );
        assert_eq!(
            resolve_mtu(&result, IP_TYPE_IPV6, Some("IPV4:1300;IPV6:1280")),
            1280
        );
        assert_eq!(
            resolve_mtu(&result, IP_TYPE_IPV4V6, Some("IPV4:1300;IPV6:1280")),
            1400
        );
    }

    #[test]
    fn malformed_mtu_config_leaves_value_unchanged() {
        let mut mtu = 1500;
        apply_mtu_override("IPV4:1300:9", IP_TYPE_IPV4, &mut mtu);
        assert_eq!(mtu, 1500);
        apply_mtu_override("IPV6:;IPV4:1300", IP_TYPE_IPV4, &mut mtu);
        assert_eq!(mtu, 1500);
        apply_mtu_override(";IPV4:1300", IP_TYPE_IPV4, &mut mtu);
        assert_eq!(mtu, 1500);
        apply_mtu_override("IPV4:abc", IP_TYPE_IPV4, &mut mtu);
        assert_eq!(mtu, 1500);
    }
}
