//! Candidate IP sources
//!
//! Every scan draws its candidates from one of several sources: the built-in
//! CDN ranges (refreshed daily from the published lists), remote community
//! lists, a user-supplied URL, historical good IPs from the persistence
//! cascade, or a manually supplied list of IPs/CIDRs/domains. Sources resolve
//! to either a static candidate list (consumed exactly once) or a set of
//! CIDR ranges handed to the [`SmartIpGenerator`](crate::SmartIpGenerator).

use crate::persistence::{CommunityQuery, HistoryQuery, ResultPersistence};
use edgescan_core::{IpSource, Result, ScanParams, UserInfo};
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use reqwest::Client;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cloudflare ranges shipped as a fallback for when the remote list is
/// unavailable at startup
const CLOUDFLARE_V4: &[&str] = &[
    "173.245.48.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "104.16.0.0/13",
    "104.24.0.0/14",
    "172.64.0.0/13",
    "131.0.72.0/22",
];

const CLOUDFLARE_V6: &[&str] = &[
    "2400:cb00::/32",
    "2606:4700::/32",
    "2803:f800::/32",
    "2405:b500::/32",
    "2405:8100::/32",
    "2a06:98c0::/29",
    "2c0f:f248::/32",
];

const CLOUDFLARE_RANGE_URLS: &[&str] = &[
    "https://www.cloudflare.com/ips-v4",
    "https://www.cloudflare.com/ips-v6",
];

const FASTLY_RANGE_URL: &str = "https://api.fastly.com/public-ip-list";

const COMMUNITY_SCRAPE_URLS: &[&str] = &[
    "https://raw.githubusercontent.com/vfarid/cf-ip-scanner/main/ipv4.txt",
    "https://raw.githubusercontent.com/ircfspace/scanner/main/ipv4.txt",
    "https://raw.githubusercontent.com/Epodon/v2ray-configs/main/Cloudflare-IPs.txt",
];

/// Popular fronting domains per country; countries without an entry fall
/// back to the global list below
const GOLD_DOMAINS_BY_COUNTRY: &[(&str, &[&str])] = &[
    (
        "United States",
        &[
            "discord.com",
            "shopify.com",
            "reddit.com",
            "zoom.us",
            "okta.com",
            "hubspot.com",
            "trello.com",
            "patreon.com",
        ],
    ),
    (
        "Germany",
        &[
            "discord.com",
            "gitlab.com",
            "zendesk.com",
            "medium.com",
            "canva.com",
            "udemy.com",
        ],
    ),
    (
        "Iran",
        &[
            "discord.com",
            "medium.com",
            "canva.com",
            "fiverr.com",
            "udemy.com",
            "upwork.com",
        ],
    ),
    (
        "Russia",
        &[
            "discord.com",
            "medium.com",
            "gitlab.com",
            "patreon.com",
            "quizlet.com",
        ],
    ),
    (
        "Turkey",
        &[
            "discord.com",
            "canva.com",
            "udemy.com",
            "fiverr.com",
            "zendesk.com",
        ],
    ),
    (
        "India",
        &[
            "discord.com",
            "shopify.com",
            "zoom.us",
            "udemy.com",
            "upwork.com",
        ],
    ),
];

/// Widely fronted domains used when no per-country list exists
const GOLD_DOMAIN_FALLBACK: &[&str] = &[
    "discord.com",
    "cloudflare.com",
    "shopify.com",
    "medium.com",
    "zoom.us",
    "fiverr.com",
    "udemy.com",
    "gitlab.com",
    "zendesk.com",
    "upwork.com",
    "patreon.com",
    "trello.com",
    "asana.com",
];

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Static lists longer than this are shuffled before scanning
const SHUFFLE_THRESHOLD: usize = 100;

/// Cap on how many addresses a single manual CIDR expands to
const MAX_EXPANSION_PER_ITEM: usize = 1 << 16;

/// Read-mostly CIDR pool with atomic full-set replacement
///
/// Scans snapshot the pool when they start; a later refresh swaps the set
/// for new scans without disturbing running ones.
pub struct RangePool {
    ranges: RwLock<Arc<Vec<IpNetwork>>>,
}

impl RangePool {
    /// Pool seeded with the built-in Cloudflare ranges
    pub fn cloudflare() -> Self {
        let ranges = CLOUDFLARE_V4
            .iter()
            .chain(CLOUDFLARE_V6.iter())
            .filter_map(|s| s.parse().ok())
            .collect();
        Self {
            ranges: RwLock::new(Arc::new(ranges)),
        }
    }

    /// Current range set (cheap clone of the `Arc`)
    pub fn snapshot(&self) -> Arc<Vec<IpNetwork>> {
        self.ranges.read().clone()
    }

    /// Atomically replace the whole set
    pub fn replace(&self, ranges: Vec<IpNetwork>) {
        *self.ranges.write() = Arc::new(ranges);
    }

    /// Refresh from the published Cloudflare lists
    ///
    /// Keeps the current set when nothing could be fetched.
    pub async fn refresh(&self, client: &Client) -> Result<usize> {
        let mut fetched = Vec::new();
        for url in CLOUDFLARE_RANGE_URLS {
            match fetch_text(client, url).await {
                Ok(body) => fetched.extend(parse_range_lines(&body)),
                Err(e) => warn!("range refresh from {} failed: {}", url, e),
            }
        }
        fetched.sort();
        fetched.dedup();
        if fetched.is_empty() {
            return Err(edgescan_core::Error::Network(
                "no ranges fetched from any source".to_string(),
            ));
        }
        let count = fetched.len();
        self.replace(fetched);
        info!("refreshed Cloudflare ranges: {} subnets", count);
        Ok(count)
    }
}

impl Default for RangePool {
    fn default() -> Self {
        Self::cloudflare()
    }
}

/// What a source resolves to for one scan
pub enum ResolvedSource {
    /// Fixed candidate list, consumed exactly once
    Static(Vec<IpAddr>),
    /// Range set for dynamic generation
    Ranges(Vec<IpNetwork>),
}

/// Resolves `ip_source`/`manual_ips` requests into candidates
pub struct SourceRegistry {
    pool: Arc<RangePool>,
    client: Client,
}

impl SourceRegistry {
    pub fn new(pool: Arc<RangePool>) -> Self {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { pool, client }
    }

    pub fn pool(&self) -> &Arc<RangePool> {
        &self.pool
    }

    /// Resolve the candidate source for a scan request
    ///
    /// Returns the resolved source plus log lines describing what happened,
    /// for the job's log ring. History-backed sources fall back to dynamic
    /// discovery over the official ranges when the cascade has nothing.
    pub async fn resolve(
        &self,
        params: &ScanParams,
        user: &UserInfo,
        persistence: Option<&ResultPersistence>,
    ) -> (ResolvedSource, Vec<String>) {
        let mut logs = Vec::new();

        if !params.manual_ips.is_empty() {
            let ips = expand_manual_list(&params.manual_ips, &mut logs).await;
            logs.push(format!("Loaded {} manual candidates.", ips.len()));
            return (ResolvedSource::Static(ips), logs);
        }

        match params.ip_source {
            IpSource::Official => (
                ResolvedSource::Ranges(self.pool.snapshot().as_ref().clone()),
                logs,
            ),
            IpSource::FastlyCdn => {
                logs.push("Fetching Fastly public ranges...".to_string());
                match self.fetch_fastly_ranges().await {
                    Ok(ranges) if !ranges.is_empty() => {
                        logs.push(format!("Loaded {} Fastly subnets.", ranges.len()));
                        (ResolvedSource::Ranges(ranges), logs)
                    }
                    _ => {
                        logs.push(
                            "Failed to load Fastly ranges. Falling back to official Cloudflare ranges."
                                .to_string(),
                        );
                        (
                            ResolvedSource::Ranges(self.pool.snapshot().as_ref().clone()),
                            logs,
                        )
                    }
                }
            }
            IpSource::AutoScrape | IpSource::CommunityScrape | IpSource::CustomUrl => {
                logs.push(format!("Fetching IPs for source: {}...", params.ip_source.tag()));
                let urls: Vec<String> = match params.ip_source {
                    IpSource::CustomUrl => params.custom_url.iter().cloned().collect(),
                    _ => COMMUNITY_SCRAPE_URLS.iter().map(|s| s.to_string()).collect(),
                };
                let ranges = self.fetch_range_lists(&urls).await;
                if ranges.is_empty() {
                    logs.push(
                        "Failed to load custom IPs. Falling back to official Cloudflare ranges."
                            .to_string(),
                    );
                    (
                        ResolvedSource::Ranges(self.pool.snapshot().as_ref().clone()),
                        logs,
                    )
                } else {
                    logs.push(format!("Loaded {} subnets/IPs from custom source.", ranges.len()));
                    (ResolvedSource::Ranges(ranges), logs)
                }
            }
            IpSource::SmartHistory => {
                logs.push("Fetching smart history based on your ISP/location...".to_string());
                let ips = match persistence {
                    Some(p) => p
                        .historical_good(&HistoryQuery {
                            isp: user.isp.clone(),
                            location: user.location.clone(),
                            limit: 100,
                        })
                        .await,
                    None => Vec::new(),
                };
                self.static_or_fallback(ips, "history", &mut logs)
            }
            IpSource::CommunityGold => {
                let country = country_of(&user.location);
                logs.push(format!(
                    "Fetching community gold IPs for {} / {}...",
                    country, user.isp
                ));
                let ips = match persistence {
                    Some(p) => p
                        .community_good(&CommunityQuery {
                            country,
                            isp: user.isp.clone(),
                            limit: 150,
                        })
                        .await,
                    None => Vec::new(),
                };
                self.static_or_fallback(ips, "community gold", &mut logs)
            }
            IpSource::GoldIps => {
                let country = country_of(&user.location);
                logs.push(format!(
                    "Fetching gold IPs for {} (history + popular fronting domains)...",
                    country
                ));
                let mut ips = match persistence {
                    Some(p) => p
                        .historical_good(&HistoryQuery {
                            isp: user.isp.clone(),
                            location: user.location.clone(),
                            limit: 50,
                        })
                        .await,
                    None => Vec::new(),
                };
                let resolved = resolve_domains(gold_domains_for(&country)).await;
                logs.push(format!(
                    "Found {} history IPs and {} domain-resolved IPs for {}.",
                    ips.len(),
                    resolved.len(),
                    country
                ));
                ips.extend(resolved.iter().map(|ip| ip.to_string()));
                ips.sort();
                ips.dedup();
                self.static_or_fallback(ips, "gold", &mut logs)
            }
        }
    }

    fn static_or_fallback(
        &self,
        ips: Vec<String>,
        label: &str,
        logs: &mut Vec<String>,
    ) -> (ResolvedSource, Vec<String>) {
        let mut parsed: Vec<IpAddr> = ips.iter().filter_map(|s| s.parse().ok()).collect();
        if parsed.is_empty() {
            logs.push(format!(
                "No {} IPs found. Falling back to smart discovery...",
                label
            ));
            return (
                ResolvedSource::Ranges(self.pool.snapshot().as_ref().clone()),
                std::mem::take(logs),
            );
        }
        logs.push(format!("Loaded {} proven IPs for your network.", parsed.len()));
        if parsed.len() > SHUFFLE_THRESHOLD {
            parsed.shuffle(&mut rand::thread_rng());
        }
        (ResolvedSource::Static(parsed), std::mem::take(logs))
    }

    async fn fetch_range_lists(&self, urls: &[String]) -> Vec<IpNetwork> {
        let mut ranges = Vec::new();
        for url in urls {
            match fetch_text(&self.client, url).await {
                Ok(body) => ranges.extend(parse_range_lines(&body)),
                Err(e) => warn!("failed to fetch {}: {}", url, e),
            }
        }
        ranges.sort();
        ranges.dedup();
        ranges
    }

    async fn fetch_fastly_ranges(&self) -> Result<Vec<IpNetwork>> {
        #[derive(serde::Deserialize)]
        struct FastlyList {
            #[serde(default)]
            addresses: Vec<String>,
            #[serde(default)]
            ipv6_addresses: Vec<String>,
        }

        let list: FastlyList = self
            .client
            .get(FASTLY_RANGE_URL)
            .send()
            .await
            .map_err(|e| edgescan_core::Error::Network(e.to_string()))?
            .json()
            .await
            .map_err(|e| edgescan_core::Error::Network(e.to_string()))?;

        Ok(list
            .addresses
            .iter()
            .chain(list.ipv6_addresses.iter())
            .filter_map(|s| s.parse().ok())
            .collect())
    }
}

async fn fetch_text(client: &Client, url: &str) -> Result<String> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| edgescan_core::Error::Network(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(edgescan_core::Error::Network(format!(
            "{} returned {}",
            url,
            resp.status()
        )));
    }
    resp.text()
        .await
        .map_err(|e| edgescan_core::Error::Network(e.to_string()))
}

/// Parse one subnet per line; bare addresses widen to /32 or /128
pub fn parse_range_lines(body: &str) -> Vec<IpNetwork> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            if line.contains('/') {
                line.parse().ok()
            } else {
                line.parse::<IpAddr>().ok().and_then(|ip| match ip {
                    IpAddr::V4(v4) => ipnetwork::Ipv4Network::new(v4, 32).ok().map(IpNetwork::V4),
                    IpAddr::V6(v6) => ipnetwork::Ipv6Network::new(v6, 128).ok().map(IpNetwork::V6),
                })
            }
        })
        .collect()
}

/// Expand a manual list of IPs, CIDRs, and domain names into candidates
pub async fn expand_manual_list(items: &[String], logs: &mut Vec<String>) -> Vec<IpAddr> {
    let mut out = Vec::new();

    for item in items {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        if item.contains('/') {
            match item.parse::<IpNetwork>() {
                Ok(net) => {
                    let before = out.len();
                    out.extend(net.iter().take(MAX_EXPANSION_PER_ITEM));
                    if out.len() - before == MAX_EXPANSION_PER_ITEM {
                        logs.push(format!(
                            "Range {} truncated to {} addresses.",
                            item, MAX_EXPANSION_PER_ITEM
                        ));
                    }
                }
                Err(e) => debug!("skipping malformed range {}: {}", item, e),
            }
        } else if item.chars().any(|c| c.is_ascii_alphabetic()) && item.contains('.') {
            match tokio::net::lookup_host((item, 443u16)).await {
                Ok(addrs) => {
                    let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                    logs.push(format!("Resolved domain {} to {} IPs.", item, ips.len()));
                    out.extend(ips);
                }
                Err(e) => logs.push(format!("Failed to resolve domain {}: {}", item, e)),
            }
        } else if let Ok(ip) = item.parse::<IpAddr>() {
            out.push(ip);
        }
    }

    if out.len() > SHUFFLE_THRESHOLD {
        out.shuffle(&mut rand::thread_rng());
    }
    out
}

/// Resolve a set of domains to their edge addresses
async fn resolve_domains(domains: &[&str]) -> Vec<IpAddr> {
    let mut out = Vec::new();
    for domain in domains {
        if let Ok(addrs) = tokio::net::lookup_host((*domain, 443u16)).await {
            out.extend(addrs.map(|a| a.ip()));
        }
    }
    out.sort();
    out.dedup();
    out
}

/// Country part of a `Country - City (ISP)` location string
fn country_of(location: &str) -> String {
    location
        .split('-')
        .next()
        .unwrap_or(location)
        .trim()
        .to_string()
}

/// Popular-domain list for a country
///
/// Unknown callers get the United States list; a country without its own
/// entry gets the global fallback.
fn gold_domains_for(country: &str) -> &'static [&'static str] {
    let country = if country.is_empty() || country == "Unknown" {
        "United States"
    } else {
        country
    };
    GOLD_DOMAINS_BY_COUNTRY
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(country))
        .map(|(_, domains)| *domains)
        .unwrap_or(GOLD_DOMAIN_FALLBACK)
}
