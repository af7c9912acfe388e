//! Geo-IP enrichment
//!
//! Best-effort lookups against a public geo endpoint: the caller's identity
//! before a scan starts, and per-candidate location/ASN after a good probe.
//! Lookup failure is never an error; everything degrades to "Unknown".

use edgescan_core::{EnrichedIp, UserInfo};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const GEO_ENDPOINT: &str = "http://ip-api.com/json";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize, Default)]
struct GeoReply {
    #[serde(default)]
    query: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    isp: String,
    #[serde(default, rename = "as")]
    asn: String,
}

/// Client for the external geo-IP service
///
/// A disabled resolver answers instantly with "Unknown" — used by tests and
/// by advanced scans, which never leave one IP.
pub struct GeoResolver {
    client: Option<Client>,
}

impl GeoResolver {
    pub fn new() -> Self {
        let client = Client::builder().timeout(LOOKUP_TIMEOUT).build().ok();
        Self { client }
    }

    pub fn disabled() -> Self {
        Self { client: None }
    }

    /// The caller's public identity as the geo service sees it
    pub async fn my_ip(&self) -> UserInfo {
        let Some(client) = &self.client else {
            return UserInfo::unknown();
        };
        match self.fetch(client, &format!("{}/", GEO_ENDPOINT)).await {
            Some(reply) => UserInfo {
                ip: non_empty(reply.query),
                location: format!("{} - {}", reply.country, reply.city),
                isp: non_empty(reply.isp),
            },
            None => UserInfo::unknown(),
        }
    }

    /// Location, ASN, and country of a scanned candidate
    pub async fn enrich(&self, ip: &str) -> EnrichedIp {
        let Some(client) = &self.client else {
            return EnrichedIp::default();
        };
        let url = format!("{}/{}?fields=country,city,isp,as", GEO_ENDPOINT, ip);
        match self.fetch(client, &url).await {
            Some(reply) => {
                let asn = reply
                    .asn
                    .split_whitespace()
                    .next()
                    .unwrap_or("Unknown")
                    .to_string();
                EnrichedIp {
                    location: format!("{} - {} ({})", reply.country, reply.city, reply.isp),
                    asn: non_empty(asn),
                    country: non_empty(reply.country),
                }
            }
            None => EnrichedIp::default(),
        }
    }

    async fn fetch(&self, client: &Client, url: &str) -> Option<GeoReply> {
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            Ok(resp) => {
                debug!("geo lookup {} returned {}", url, resp.status());
                None
            }
            Err(e) => {
                debug!("geo lookup {} failed: {}", url, e);
                None
            }
        }
    }
}

impl Default for GeoResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(s: String) -> String {
    if s.is_empty() {
        "Unknown".to_string()
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_resolver_is_instant() {
        let resolver = GeoResolver::disabled();
        let user = resolver.my_ip().await;
        assert_eq!(user.ip, "Unknown");

        let enriched = resolver.enrich("1.1.1.1").await;
        assert_eq!(enriched.location, "Unknown");
        assert_eq!(enriched.asn, "Unknown");
    }

    #[test]
    fn test_reply_parsing() {
        let reply: GeoReply = serde_json::from_str(
            r#"{"query":"1.2.3.4","country":"Germany","city":"Berlin","isp":"ISP X","as":"AS13335 Cloudflare"}"#,
        )
        .unwrap();
        assert_eq!(reply.country, "Germany");
        assert_eq!(reply.asn, "AS13335 Cloudflare");
        assert_eq!(reply.asn.split_whitespace().next().unwrap(), "AS13335");
    }
}
