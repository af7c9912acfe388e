//! Proxy-core runtime config synthesis
//!
//! Builds the JSON configuration the external xray-compatible core runs
//! with: a local SOCKS5 inbound and one outbound built from the user's proxy
//! URI but pointed at the candidate IP instead of the original host.
//! Advanced scans layer a fragmenting dialer, an SNI override, or a DNS
//! redirect on top of the same base config. The persistence cascade reuses
//! the builder for its dokodemo-door database forward.

use edgescan_core::{ProxyScheme, ProxyUri, Security, Transport};
use rand::Rng;
use serde_json::{json, Value};
use std::net::IpAddr;

/// Local SOCKS ports are drawn from this range, one per probe
const SOCKS_PORT_RANGE: std::ops::RangeInclusive<u16> = 10_000..=20_000;

/// TLS ClientHello fragmentation policy for censorship bypass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPolicy {
    /// Which packets to fragment: `tlshello` or a range like `1-3`
    pub packets: String,
    /// Fragment length range, e.g. `10-20`
    pub length: String,
    /// Inter-fragment interval range in ms, e.g. `10-20`
    pub interval: String,
}

/// Per-variant tunnel adjustments for advanced scans
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelVariant {
    /// Human-readable label, carried into the outcome's `tested_config`
    pub label: String,
    pub fragment: Option<FragmentPolicy>,
    pub sni_override: Option<String>,
    /// Redirect port-53 traffic through a dedicated DNS outbound
    pub dns_nameserver: Option<String>,
    pub utls_fingerprint: Option<String>,
}

/// Pick a random local SOCKS port for one probe
pub fn ephemeral_socks_port() -> u16 {
    rand::thread_rng().gen_range(SOCKS_PORT_RANGE)
}

/// Build the probe config: SOCKS inbound on `127.0.0.1:<socks_port>`,
/// outbound through the user's proxy at `target_ip:target_port`
pub fn probe_config(
    proxy: &ProxyUri,
    target_ip: &IpAddr,
    target_port: u16,
    socks_port: u16,
    variant: &TunnelVariant,
) -> Value {
    let mut outbounds = vec![primary_outbound(proxy, &target_ip.to_string(), target_port, variant)];

    if let Some(policy) = &variant.fragment {
        outbounds.push(fragment_outbound(policy));
    }

    let mut config = json!({
        "log": { "loglevel": "none" },
        "inbounds": [{
            "listen": "127.0.0.1",
            "port": socks_port,
            "protocol": "socks",
            "settings": { "auth": "noauth", "udp": true },
            "sniffing": { "enabled": true, "destOverride": ["http", "tls"] }
        }],
        "outbounds": outbounds,
    });

    if let Some(nameserver) = &variant.dns_nameserver {
        if let Some(outbounds) = config["outbounds"].as_array_mut() {
            outbounds.push(json!({
                "tag": "dns-out",
                "protocol": "dns",
                "settings": { "address": nameserver, "port": 53 }
            }));
        }
        config["routing"] = json!({
            "rules": [{
                "type": "field",
                "port": "53",
                "outboundTag": "dns-out"
            }]
        });
    }

    config
}

/// Build the dokodemo-door forward used by persistence layer 4: a local
/// inbound that pipes `127.0.0.1:<local_port>` to `remote_host:remote_port`
/// through the user's proxy
pub fn forward_config(
    proxy: &ProxyUri,
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
) -> Value {
    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [{
            "listen": "127.0.0.1",
            "port": local_port,
            "protocol": "dokodemo-door",
            "settings": {
                "address": remote_host,
                "port": remote_port,
                "network": "tcp"
            }
        }],
        "outbounds": [primary_outbound(proxy, &proxy.host, proxy.port, &TunnelVariant::default())],
    })
}

fn primary_outbound(
    proxy: &ProxyUri,
    address: &str,
    port: u16,
    variant: &TunnelVariant,
) -> Value {
    let settings = match proxy.scheme {
        ProxyScheme::Vless => {
            let mut user = json!({
                "id": proxy.credential,
                "encryption": proxy.encryption(),
            });
            if let Some(flow) = proxy.flow() {
                user["flow"] = json!(flow);
            }
            json!({
                "vnext": [{
                    "address": address,
                    "port": port,
                    "users": [user]
                }]
            })
        }
        ProxyScheme::Trojan => json!({
            "servers": [{
                "address": address,
                "port": port,
                "password": proxy.credential
            }]
        }),
    };

    let mut sockopt = json!({
        "tcpNoDelay": true,
        "tcpKeepAliveIdle": 30,
        "mss": 1440
    });
    if variant.fragment.is_some() {
        sockopt["dialerProxy"] = json!("fragment");
    }

    let mut stream = json!({
        "network": network_name(proxy),
        "sockopt": sockopt,
    });

    match proxy.transport() {
        Transport::Ws { path, host } => {
            let mut ws = json!({ "path": path });
            if !host.is_empty() {
                ws["headers"] = json!({ "Host": host });
            }
            stream["wsSettings"] = ws;
        }
        Transport::Grpc { service_name } => {
            stream["grpcSettings"] = json!({ "serviceName": service_name });
        }
        Transport::Tcp => {}
    }

    match proxy.security() {
        Security::Tls(opts) => {
            let sni = variant.sni_override.as_deref().unwrap_or(&opts.sni);
            let fp = variant
                .utls_fingerprint
                .as_deref()
                .unwrap_or(&opts.fingerprint);
            let mut tls = json!({
                "serverName": sni,
                "allowInsecure": true,
            });
            if !fp.is_empty() {
                tls["fingerprint"] = json!(fp);
            }
            if !opts.alpn.is_empty() {
                tls["alpn"] = json!(opts.alpn);
            }
            stream["security"] = json!("tls");
            stream["tlsSettings"] = tls;
        }
        Security::Reality(opts) => {
            let sni = variant.sni_override.as_deref().unwrap_or(&opts.sni);
            let fp = variant
                .utls_fingerprint
                .as_deref()
                .unwrap_or(&opts.fingerprint);
            stream["security"] = json!("reality");
            stream["realitySettings"] = json!({
                "serverName": sni,
                "fingerprint": fp,
                "publicKey": opts.public_key,
                "shortId": opts.short_id,
                "spiderX": opts.spider_x,
            });
        }
        Security::None => {
            stream["security"] = json!("none");
        }
    }

    json!({
        "protocol": proxy.scheme.to_string(),
        "settings": settings,
        "streamSettings": stream,
    })
}

fn fragment_outbound(policy: &FragmentPolicy) -> Value {
    json!({
        "tag": "fragment",
        "protocol": "freedom",
        "settings": {
            "fragment": {
                "packets": policy.packets,
                "length": policy.length,
                "interval": policy.interval,
            }
        }
    })
}

fn network_name(proxy: &ProxyUri) -> &'static str {
    match proxy.transport() {
        Transport::Tcp => "tcp",
        Transport::Ws { .. } => "ws",
        Transport::Grpc { .. } => "grpc",
    }
}
