//! Export encoders
//!
//! Turn a set of good IPs plus the original proxy URI into client-ready
//! profiles: a base64 subscription blob, a Clash YAML document, or a
//! sing-box JSON outbound list.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use edgescan_core::{Error, ProxyScheme, ProxyUri, Result, Security, Transport};
use serde_json::{json, Value};
use std::net::IpAddr;

/// Requested export format
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Base64,
    Clash,
    Singbox,
}

/// Encode `ips` in the requested format
pub fn export(format: ExportFormat, proxy: &ProxyUri, ips: &[String]) -> Result<String> {
    match format {
        ExportFormat::Base64 => Ok(export_base64(proxy, ips)),
        ExportFormat::Clash => export_clash(proxy, ips),
        ExportFormat::Singbox => export_singbox(proxy, ips),
    }
}

/// Base64 of newline-joined reconstructed URIs
pub fn export_base64(proxy: &ProxyUri, ips: &[String]) -> String {
    let lines: Vec<String> = ips
        .iter()
        .filter_map(|ip| {
            ip.parse::<IpAddr>()
                .ok()
                .map(|addr| proxy.with_endpoint(&addr, proxy.port))
        })
        .collect();
    BASE64.encode(lines.join("\n"))
}

/// Clash YAML: proxies + one `Proxy` selector group + a match-all rule
pub fn export_clash(proxy: &ProxyUri, ips: &[String]) -> Result<String> {
    let mut proxies = Vec::new();
    for ip in ips {
        proxies.push(clash_proxy(proxy, ip));
    }
    let names: Vec<Value> = proxies
        .iter()
        .map(|p| p["name"].clone())
        .collect();

    let doc = json!({
        "proxies": proxies,
        "proxy-groups": [{
            "name": "Proxy",
            "type": "select",
            "proxies": names,
        }],
        "rules": ["MATCH,Proxy"],
    });
    serde_yaml::to_string(&doc).map_err(|e| Error::Serialization(format!("YAML error: {}", e)))
}

fn clash_proxy(proxy: &ProxyUri, ip: &str) -> Value {
    let mut entry = json!({
        "name": format!("CF-{}", ip),
        "type": proxy.scheme.to_string(),
        "server": ip,
        "port": proxy.port,
        "udp": true,
        "network": proxy.net_type(),
    });

    match proxy.scheme {
        ProxyScheme::Vless => entry["uuid"] = json!(proxy.credential),
        ProxyScheme::Trojan => entry["password"] = json!(proxy.credential),
    }

    match proxy.security() {
        Security::Tls(opts) => {
            entry["tls"] = json!(true);
            entry["sni"] = json!(opts.sni);
            if !opts.fingerprint.is_empty() {
                entry["client-fingerprint"] = json!(opts.fingerprint);
            }
        }
        Security::Reality(opts) => {
            entry["tls"] = json!(true);
            entry["servername"] = json!(opts.sni);
            entry["reality-opts"] = json!({
                "public-key": opts.public_key,
                "short-id": opts.short_id,
            });
            if !opts.fingerprint.is_empty() {
                entry["client-fingerprint"] = json!(opts.fingerprint);
            }
        }
        Security::None => {
            entry["tls"] = json!(false);
        }
    }

    match proxy.transport() {
        Transport::Ws { path, host } => {
            let host = if host.is_empty() {
                proxy.sni()
            } else {
                host
            };
            entry["ws-opts"] = json!({
                "path": path,
                "headers": { "Host": host },
            });
        }
        Transport::Grpc { service_name } => {
            entry["grpc-opts"] = json!({ "grpc-service-name": service_name });
        }
        Transport::Tcp => {}
    }

    entry
}

/// sing-box JSON: a `select` selector followed by the outbound array
pub fn export_singbox(proxy: &ProxyUri, ips: &[String]) -> Result<String> {
    let outbounds: Vec<Value> = ips.iter().map(|ip| singbox_outbound(proxy, ip)).collect();
    let tags: Vec<Value> = outbounds.iter().map(|o| o["tag"].clone()).collect();

    let mut all = vec![json!({
        "type": "selector",
        "tag": "select",
        "outbounds": tags,
    })];
    all.extend(outbounds);

    serde_json::to_string_pretty(&json!({ "outbounds": all }))
        .map_err(|e| Error::Serialization(format!("JSON error: {}", e)))
}

fn singbox_outbound(proxy: &ProxyUri, ip: &str) -> Value {
    let mut outbound = json!({
        "type": proxy.scheme.to_string(),
        "tag": format!("CF-{}", ip),
        "server": ip,
        "server_port": proxy.port,
    });

    match proxy.scheme {
        ProxyScheme::Vless => outbound["uuid"] = json!(proxy.credential),
        ProxyScheme::Trojan => outbound["password"] = json!(proxy.credential),
    }

    match proxy.security() {
        Security::Tls(opts) => {
            outbound["tls"] = json!({
                "enabled": true,
                "server_name": opts.sni,
                "insecure": true,
            });
        }
        Security::Reality(opts) => {
            let mut tls = json!({
                "enabled": true,
                "server_name": opts.sni,
                "reality": {
                    "enabled": true,
                    "public_key": opts.public_key,
                    "short_id": opts.short_id,
                },
            });
            if !opts.fingerprint.is_empty() {
                tls["utls"] = json!({
                    "enabled": true,
                    "fingerprint": opts.fingerprint,
                });
            }
            outbound["tls"] = tls;
        }
        Security::None => {}
    }

    match proxy.transport() {
        Transport::Ws { path, host } => {
            let host = if host.is_empty() {
                proxy.sni()
            } else {
                host
            };
            outbound["transport"] = json!({
                "type": "ws",
                "path": path,
                "headers": { "Host": host },
            });
        }
        Transport::Grpc { service_name } => {
            outbound["transport"] = json!({
                "type": "grpc",
                "service_name": service_name,
            });
        }
        Transport::Tcp => {}
    }

    outbound
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> ProxyUri {
        ProxyUri::parse(
            "vless://uuid-1@origin.example:2053?type=ws&security=tls&sni=cdn.example.com&fp=chrome&path=%2Fws",
        )
    }

    #[test]
    fn test_base64_round_trip() {
        let ips = vec!["104.16.1.1".to_string(), "104.16.2.2".to_string()];
        let blob = export_base64(&proxy(), &ips);

        let decoded = String::from_utf8(BASE64.decode(blob).unwrap()).unwrap();
        let lines: Vec<&str> = decoded.lines().collect();
        assert_eq!(lines.len(), 2);

        for (line, ip) in lines.iter().zip(&ips) {
            let reparsed = ProxyUri::parse(line);
            assert_eq!(&reparsed.host, ip);
            assert_eq!(reparsed.credential, "uuid-1");
            assert_eq!(reparsed.port, 2053);
            assert_eq!(reparsed.params, proxy().params);
            assert!(line.ends_with(&format!("#IP-{}", ip)));
        }
    }

    #[test]
    fn test_base64_skips_unparseable_entries() {
        let ips = vec!["104.16.1.1".to_string(), "not-an-ip".to_string()];
        let blob = export_base64(&proxy(), &ips);
        let decoded = String::from_utf8(BASE64.decode(blob).unwrap()).unwrap();
        assert_eq!(decoded.lines().count(), 1);
    }

    #[test]
    fn test_clash_document_shape() {
        let ips = vec!["104.16.1.1".to_string()];
        let yaml = export_clash(&proxy(), &ips).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        let proxies = doc["proxies"].as_sequence().unwrap();
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0]["name"].as_str().unwrap(), "CF-104.16.1.1");
        assert_eq!(proxies[0]["uuid"].as_str().unwrap(), "uuid-1");
        assert_eq!(proxies[0]["tls"].as_bool().unwrap(), true);
        assert_eq!(proxies[0]["ws-opts"]["path"].as_str().unwrap(), "/ws");

        let groups = doc["proxy-groups"].as_sequence().unwrap();
        assert_eq!(groups[0]["name"].as_str().unwrap(), "Proxy");
        assert_eq!(
            groups[0]["proxies"][0].as_str().unwrap(),
            "CF-104.16.1.1"
        );
        assert_eq!(doc["rules"][0].as_str().unwrap(), "MATCH,Proxy");
    }

    #[test]
    fn test_clash_reality_options() {
        let reality = ProxyUri::parse(
            "vless://u@h:443?type=grpc&serviceName=svc&security=reality&sni=r.example&pbk=PUB&sid=1f&fp=firefox",
        );
        let yaml = export_clash(&reality, &["104.16.1.1".to_string()]).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let entry = &doc["proxies"][0];

        assert_eq!(entry["reality-opts"]["public-key"].as_str().unwrap(), "PUB");
        assert_eq!(entry["reality-opts"]["short-id"].as_str().unwrap(), "1f");
        assert_eq!(entry["client-fingerprint"].as_str().unwrap(), "firefox");
        assert_eq!(
            entry["grpc-opts"]["grpc-service-name"].as_str().unwrap(),
            "svc"
        );
    }

    #[test]
    fn test_singbox_selector_leads() {
        let ips = vec!["104.16.1.1".to_string(), "104.16.2.2".to_string()];
        let body = export_singbox(&proxy(), &ips).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&body).unwrap();

        let outbounds = doc["outbounds"].as_array().unwrap();
        assert_eq!(outbounds.len(), 3);
        assert_eq!(outbounds[0]["type"], "selector");
        assert_eq!(outbounds[0]["tag"], "select");
        assert_eq!(outbounds[0]["outbounds"].as_array().unwrap().len(), 2);
        assert_eq!(outbounds[1]["server"], "104.16.1.1");
        assert_eq!(outbounds[1]["tls"]["insecure"], true);
    }

    #[test]
    fn test_trojan_export_uses_password() {
        let trojan = ProxyUri::parse("trojan://secret@h:443?security=tls&sni=s.example");
        let yaml = export_clash(&trojan, &["104.16.1.1".to_string()]).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(doc["proxies"][0]["password"].as_str().unwrap(), "secret");
        assert!(doc["proxies"][0].get("uuid").is_none());

        let body = export_singbox(&trojan, &["104.16.1.1".to_string()]).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["outbounds"][1]["password"], "secret");
    }
}
