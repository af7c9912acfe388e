//! Parser and reconstruction properties
//!
//! The parser must be total over arbitrary byte strings, exact over
//! well-formed URIs, and reconstruction must survive a reparse.

use edgescan_core::{ProxyScheme, ProxyUri, Security, Transport};
use std::net::IpAddr;

#[test]
fn parse_never_panics_on_arbitrary_input() {
    // A deterministic pile of hostile inputs: truncations, control bytes,
    // repeated separators, and mixed valid/invalid fragments
    let mut inputs: Vec<String> = vec![
        String::new(),
        "vless".to_string(),
        "vless:".to_string(),
        "vless://".to_string(),
        "vless://@".to_string(),
        "vless://@@@@".to_string(),
        "vless://u@h:p?=#".to_string(),
        "trojan://%%%@[::]:99999?a=b".to_string(),
        "vless://u@h:443?&&&&".to_string(),
        "vless://u@[fe80::1".to_string(),
        "\u{0}\u{1}\u{fffd}".to_string(),
    ];
    let base = "vless://uuid@example.com:443?type=ws&security=tls#tag";
    for cut in 0..base.len() {
        inputs.push(base[..cut].to_string());
    }
    for input in &inputs {
        let parsed = ProxyUri::parse(input);
        // Every result is structurally usable
        assert!(!parsed.host.is_empty());
        assert!(parsed.port > 0);
    }
}

#[test]
fn well_formed_uri_parses_exactly() {
    let uri = ProxyUri::parse("vless://U-123@example.org:8443?type=grpc&serviceName=svc&k=v#R");
    assert_eq!(uri.scheme, ProxyScheme::Vless);
    assert_eq!(uri.credential, "U-123");
    assert_eq!(uri.host, "example.org");
    assert_eq!(uri.port, 8443);
    assert_eq!(
        uri.params,
        vec![
            ("type".to_string(), "grpc".to_string()),
            ("serviceName".to_string(), "svc".to_string()),
            ("k".to_string(), "v".to_string()),
        ]
    );
}

#[test]
fn reconstruction_round_trips_for_many_endpoints() {
    let original =
        ProxyUri::parse("trojan://pw@origin.example:2083?security=reality&sni=s.x&pbk=P&sid=ab&fp=ios");

    let endpoints: Vec<IpAddr> = vec![
        "104.16.0.1".parse().unwrap(),
        "172.64.255.254".parse().unwrap(),
        "2606:4700::1234".parse().unwrap(),
    ];

    for ip in endpoints {
        let link = original.with_endpoint(&ip, original.port);
        let reparsed = ProxyUri::parse(&link);

        assert_eq!(reparsed.scheme, ProxyScheme::Trojan);
        assert_eq!(reparsed.credential, original.credential);
        assert_eq!(reparsed.host, ip.to_string().trim_matches(['[', ']']));
        assert_eq!(reparsed.port, original.port);
        assert_eq!(reparsed.params, original.params);
        assert!(link.ends_with(&format!("#IP-{}", ip)));
    }
}

#[test]
fn typed_views_agree_with_raw_params() {
    let uri = ProxyUri::parse(
        "vless://u@h:443?type=ws&path=%2Fdeep%2Fpath&host=front.example&security=tls&sni=front.example&alpn=h2",
    );

    match uri.transport() {
        Transport::Ws { path, host } => {
            assert_eq!(path, "/deep/path");
            assert_eq!(host, "front.example");
        }
        other => panic!("expected ws transport, got {:?}", other),
    }
    match uri.security() {
        Security::Tls(opts) => {
            assert_eq!(opts.sni, "front.example");
            assert_eq!(opts.alpn, vec!["h2".to_string()]);
        }
        other => panic!("expected tls, got {:?}", other),
    }

    // The raw params still carry the percent-encoded original
    assert_eq!(uri.param("path"), Some("%2Fdeep%2Fpath"));
}
