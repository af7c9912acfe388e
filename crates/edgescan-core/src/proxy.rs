//! VLESS/Trojan proxy URI model
//!
//! Parsing is total: any structurally broken input yields a safe sentinel
//! record instead of an error, so a malformed user config can never take a
//! scan down after it has started. Query parameters are kept verbatim and in
//! order so that reconstructed links carry exactly the keys the user supplied;
//! typed [`Transport`] and [`Security`] views are derived on demand for the
//! tunnel config synthesizer.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Proxy protocol carried by the URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Vless,
    Trojan,
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyScheme::Vless => write!(f, "vless"),
            ProxyScheme::Trojan => write!(f, "trojan"),
        }
    }
}

/// Transport layer of the tunnel stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Ws { path: String, host: String },
    Grpc { service_name: String },
}

/// TLS options shared by the `tls` security mode
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsOptions {
    pub sni: String,
    pub fingerprint: String,
    pub alpn: Vec<String>,
}

/// Reality options for the `reality` security mode
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RealityOptions {
    pub sni: String,
    pub fingerprint: String,
    pub public_key: String,
    pub short_id: String,
    pub spider_x: String,
}

/// Security layer of the tunnel stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Security {
    None,
    Tls(TlsOptions),
    Reality(RealityOptions),
}

/// A parsed VLESS or Trojan URI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyUri {
    pub scheme: ProxyScheme,
    /// UUID (vless) or password (trojan); the segment before `@`
    pub credential: String,
    pub host: String,
    pub port: u16,
    /// Query parameters, verbatim and in original order
    pub params: Vec<(String, String)>,
}

impl ProxyUri {
    /// Safe sentinel returned for structurally broken input
    pub fn sentinel() -> Self {
        Self {
            scheme: ProxyScheme::Vless,
            credential: String::new(),
            host: "127.0.0.1".to_string(),
            port: 443,
            params: Vec::new(),
        }
    }

    /// Parse a proxy URI; never fails
    ///
    /// `vless://<credential>@<host>:<port>?<k=v&...>#<remark>`. The fragment
    /// is ignored. A port that is not plain digits falls back to 443.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        let (scheme, rest) = if let Some(rest) = input.strip_prefix("vless://") {
            (ProxyScheme::Vless, rest)
        } else if let Some(rest) = input.strip_prefix("trojan://") {
            (ProxyScheme::Trojan, rest)
        } else {
            return Self::sentinel();
        };

        // Drop any #remark
        let rest = rest.split('#').next().unwrap_or("");

        let Some((credential, after_at)) = rest.split_once('@') else {
            return Self::sentinel();
        };
        if credential.is_empty() || after_at.is_empty() {
            return Self::sentinel();
        }

        let (host_port, query) = match after_at.split_once('?') {
            Some((hp, q)) => (hp, q),
            None => (after_at, ""),
        };

        let (host, port) = split_host_port(host_port);
        if host.is_empty() {
            return Self::sentinel();
        }

        let params = query
            .split('&')
            .filter(|p| !p.is_empty())
            .filter_map(|p| p.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Self {
            scheme,
            credential: credential.to_string(),
            host: host.to_string(),
            port,
            params,
        }
    }

    /// Look up a query parameter by key (first occurrence)
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn param_or(&self, key: &str, default: &str) -> String {
        self.param(key).unwrap_or(default).to_string()
    }

    /// Typed transport view of the query parameters
    pub fn transport(&self) -> Transport {
        match self.param("type") {
            Some("ws") => Transport::Ws {
                path: percent_decode_str(self.param("path").unwrap_or("/"))
                    .decode_utf8_lossy()
                    .into_owned(),
                host: self.param_or("host", ""),
            },
            Some("grpc") => Transport::Grpc {
                service_name: self.param_or("serviceName", ""),
            },
            _ => Transport::Tcp,
        }
    }

    /// Typed security view of the query parameters
    pub fn security(&self) -> Security {
        match self.param("security") {
            Some("tls") => Security::Tls(TlsOptions {
                sni: self.param_or("sni", ""),
                fingerprint: self.param_or("fp", ""),
                alpn: self
                    .param("alpn")
                    .map(|raw| {
                        percent_decode_str(raw)
                            .decode_utf8_lossy()
                            .split(',')
                            .filter(|s| !s.is_empty())
                            .map(|s| s.to_string())
                            .collect()
                    })
                    .unwrap_or_default(),
            }),
            Some("reality") => Security::Reality(RealityOptions {
                sni: self.param_or("sni", ""),
                fingerprint: self.param_or("fp", ""),
                public_key: self.param_or("pbk", ""),
                short_id: self.param_or("sid", ""),
                spider_x: self.param_or("spx", ""),
            }),
            _ => Security::None,
        }
    }

    /// VLESS encryption setting (`none` unless overridden)
    pub fn encryption(&self) -> String {
        self.param_or("encryption", "none")
    }

    /// VLESS flow control, if any
    pub fn flow(&self) -> Option<&str> {
        self.param("flow").filter(|f| !f.is_empty())
    }

    /// SNI the scan was configured with, for result records
    pub fn sni(&self) -> String {
        self.param_or("sni", "Unknown")
    }

    /// Transport name for result records (`tcp`, `ws`, `grpc`)
    pub fn net_type(&self) -> String {
        self.param_or("type", "tcp")
    }

    /// Reconstruct this URI pointing at a new endpoint, with an `IP-<ip>`
    /// remark. IPv6 addresses are bracketed.
    pub fn with_endpoint(&self, ip: &IpAddr, port: u16) -> String {
        let host = format_host(ip);
        let mut out = format!("{}://{}@{}:{}", self.scheme, self.credential, host, port);
        if !self.params.is_empty() {
            let query: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            out.push('?');
            out.push_str(&query.join("&"));
        }
        out.push_str(&format!("#IP-{}", ip));
        out
    }
}

fn format_host(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}

/// Split `host:port`, handling bracketed IPv6 literals. A missing or
/// non-numeric port yields 443.
fn split_host_port(input: &str) -> (&str, u16) {
    if let Some(rest) = input.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            let port = after
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(443);
            return (host, port);
        }
        return ("", 443);
    }

    match input.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().unwrap_or(443)),
        None => (input, 443),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_well_formed_vless() {
        let uri = ProxyUri::parse(
            "vless://abc-123@example.com:2053?type=ws&security=tls&sni=cdn.example.com&path=%2Fws#remark",
        );
        assert_eq!(uri.scheme, ProxyScheme::Vless);
        assert_eq!(uri.credential, "abc-123");
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, 2053);
        assert_eq!(uri.param("type"), Some("ws"));
        assert_eq!(uri.param("sni"), Some("cdn.example.com"));
        // Fragment is dropped
        assert!(uri.params.iter().all(|(k, _)| k != "remark"));
    }

    #[test]
    fn test_parse_trojan() {
        let uri = ProxyUri::parse("trojan://p4ss@host.example:443?security=tls&sni=host.example");
        assert_eq!(uri.scheme, ProxyScheme::Trojan);
        assert_eq!(uri.credential, "p4ss");
    }

    #[test]
    fn test_parse_is_total() {
        // None of these may panic; all structural failures hit the sentinel
        for garbage in [
            "",
            "http://not-a-proxy",
            "vless://",
            "vless://no-at-sign",
            "vless://@:",
            "vless://u@",
            "trojan://@host:443",
            "vless://u@h:443?=&&=x",
            "\u{0}\u{1}\u{2}",
        ] {
            let uri = ProxyUri::parse(garbage);
            assert!(uri.port > 0);
        }

        let sentinel = ProxyUri::parse("not a uri at all");
        assert_eq!(sentinel.scheme, ProxyScheme::Vless);
        assert_eq!(sentinel.host, "127.0.0.1");
        assert_eq!(sentinel.port, 443);
        assert!(sentinel.params.is_empty());
    }

    #[test]
    fn test_bad_port_defaults_to_443() {
        let uri = ProxyUri::parse("vless://u@example.com:notaport?type=tcp");
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, 443);

        let uri = ProxyUri::parse("vless://u@example.com");
        assert_eq!(uri.port, 443);
    }

    #[test]
    fn test_ipv6_host() {
        let uri = ProxyUri::parse("vless://u@[2606:4700::1]:8443?type=tcp");
        assert_eq!(uri.host, "2606:4700::1");
        assert_eq!(uri.port, 8443);
    }

    #[test]
    fn test_param_order_preserved() {
        let uri = ProxyUri::parse("vless://u@h:443?zeta=1&alpha=2&mid=3");
        let keys: Vec<&str> = uri.params.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_transport_views() {
        let ws = ProxyUri::parse("vless://u@h:443?type=ws&path=%2Fchat&host=cdn.example.com");
        assert_eq!(
            ws.transport(),
            Transport::Ws {
                path: "/chat".to_string(),
                host: "cdn.example.com".to_string()
            }
        );

        let grpc = ProxyUri::parse("vless://u@h:443?type=grpc&serviceName=svc");
        assert_eq!(
            grpc.transport(),
            Transport::Grpc {
                service_name: "svc".to_string()
            }
        );

        let tcp = ProxyUri::parse("vless://u@h:443");
        assert_eq!(tcp.transport(), Transport::Tcp);
    }

    #[test]
    fn test_security_views() {
        let tls = ProxyUri::parse("vless://u@h:443?security=tls&sni=a.com&fp=chrome&alpn=h2%2Chttp%2F1.1");
        match tls.security() {
            Security::Tls(opts) => {
                assert_eq!(opts.sni, "a.com");
                assert_eq!(opts.fingerprint, "chrome");
                assert_eq!(opts.alpn, vec!["h2".to_string(), "http/1.1".to_string()]);
            }
            other => panic!("expected tls, got {:?}", other),
        }

        let reality =
            ProxyUri::parse("vless://u@h:443?security=reality&sni=a.com&pbk=KEY&sid=ab12&spx=%2F");
        match reality.security() {
            Security::Reality(opts) => {
                assert_eq!(opts.public_key, "KEY");
                assert_eq!(opts.short_id, "ab12");
                assert_eq!(opts.spider_x, "/");
            }
            other => panic!("expected reality, got {:?}", other),
        }

        assert_eq!(ProxyUri::parse("vless://u@h:443").security(), Security::None);
    }

    #[test]
    fn test_with_endpoint_round_trip() {
        let uri = ProxyUri::parse("vless://uuid-1@origin.example:2053?type=ws&security=tls&sni=x.y");
        let ip: IpAddr = "104.16.1.2".parse().unwrap();
        let link = uri.with_endpoint(&ip, 2053);
        assert_eq!(
            link,
            "vless://uuid-1@104.16.1.2:2053?type=ws&security=tls&sni=x.y#IP-104.16.1.2"
        );

        // Reparsing the link must give the same record with the new host
        let reparsed = ProxyUri::parse(&link);
        assert_eq!(reparsed.credential, uri.credential);
        assert_eq!(reparsed.host, "104.16.1.2");
        assert_eq!(reparsed.params, uri.params);
    }

    #[test]
    fn test_with_endpoint_ipv6() {
        let uri = ProxyUri::parse("vless://u@h:443?type=tcp");
        let ip: IpAddr = "2606:4700::1".parse().unwrap();
        let link = uri.with_endpoint(&ip, 443);
        assert!(link.starts_with("vless://u@[2606:4700::1]:443?"));
        assert!(link.ends_with("#IP-2606:4700::1"));

        let reparsed = ProxyUri::parse(&link);
        assert_eq!(reparsed.host, "2606:4700::1");
    }

    #[test]
    fn test_flow_and_encryption() {
        let uri = ProxyUri::parse("vless://u@h:443?flow=xtls-rprx-vision&encryption=none");
        assert_eq!(uri.flow(), Some("xtls-rprx-vision"));
        assert_eq!(uri.encryption(), "none");

        let plain = ProxyUri::parse("vless://u@h:443");
        assert_eq!(plain.flow(), None);
        assert_eq!(plain.encryption(), "none");
    }
}
