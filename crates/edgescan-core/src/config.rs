//! Scan parameters, thresholds, and persisted settings

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Address family requested for candidate generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    Ipv4,
    Ipv6,
    All,
}

impl IpVersion {
    /// Whether an address belongs to this family selection
    pub fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            IpVersion::Ipv4 => ip.is_ipv4(),
            IpVersion::Ipv6 => ip.is_ipv6(),
            IpVersion::All => true,
        }
    }
}

impl Default for IpVersion {
    fn default() -> Self {
        IpVersion::Ipv4
    }
}

/// Where candidate IPs come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpSource {
    /// Built-in Cloudflare ranges, refreshed daily from the published lists
    Official,
    /// Historically good IPs for the caller's ISP and location
    SmartHistory,
    /// Recently verified IPs from other users in the same region
    CommunityGold,
    /// History IPs plus addresses resolved from popular fronting domains
    GoldIps,
    /// Community-maintained scrape lists on GitHub
    AutoScrape,
    /// Community repository IP lists
    CommunityScrape,
    /// User-supplied URL with one IP or CIDR per line
    CustomUrl,
    /// Fastly public ranges
    FastlyCdn,
}

impl Default for IpSource {
    fn default() -> Self {
        IpSource::Official
    }
}

impl IpSource {
    /// Tag written into result records for this source
    pub fn tag(&self) -> &'static str {
        match self {
            IpSource::Official => "official",
            IpSource::SmartHistory => "smart_history",
            IpSource::CommunityGold => "community_gold",
            IpSource::GoldIps => "gold_ips",
            IpSource::AutoScrape => "auto_scrape",
            IpSource::CommunityScrape => "community_scrape",
            IpSource::CustomUrl => "custom_url",
            IpSource::FastlyCdn => "fastly_cdn",
        }
    }

    /// Which CDN's trace endpoint identifies the datacenter for this source
    pub fn is_fastly(&self) -> bool {
        matches!(self, IpSource::FastlyCdn)
    }
}

/// Quality thresholds a candidate must pass to be reported as good
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    pub max_ping: f64,
    pub max_jitter: f64,
    pub min_download: f64,
    pub min_upload: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_ping: 1000.0,
            max_jitter: 500.0,
            min_download: 0.1,
            min_upload: 0.1,
        }
    }
}

fn default_ip_count() -> u64 {
    10
}

fn default_concurrency() -> usize {
    10
}

fn default_stop_after() -> u64 {
    10
}

fn default_max_ping() -> f64 {
    1500.0
}

fn default_max_jitter() -> f64 {
    500.0
}

fn default_min_rate() -> f64 {
    0.1
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Parameters of one scan request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanParams {
    pub vless_config: String,
    #[serde(default)]
    pub manual_ips: Vec<String>,
    #[serde(default = "default_ip_count")]
    pub ip_count: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub ip_version: IpVersion,
    #[serde(default = "default_stop_after")]
    pub stop_after: u64,
    #[serde(default)]
    pub ip_source: IpSource,
    #[serde(default)]
    pub custom_url: Option<String>,
    #[serde(default = "default_max_ping")]
    pub max_ping: f64,
    #[serde(default = "default_max_jitter")]
    pub max_jitter: f64,
    #[serde(default = "default_min_rate")]
    pub min_download: f64,
    #[serde(default = "default_min_rate")]
    pub min_upload: f64,
    #[serde(default)]
    pub test_ports: Vec<u16>,
    #[serde(default)]
    pub verify_tls: bool,
    #[serde(default)]
    pub target_country: Option<String>,
    #[serde(default)]
    pub use_system_proxy: bool,
    #[serde(default = "default_app_version")]
    pub app_version: String,
}

impl ScanParams {
    /// Validate bounds the scheduler relies on
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.concurrency > 1000 {
            return Err(Error::Config("concurrency cannot exceed 1000".to_string()));
        }
        if self.stop_after == 0 {
            return Err(Error::Config("stop_after must be at least 1".to_string()));
        }
        if self.test_ports.iter().any(|p| *p == 0) {
            return Err(Error::Config("port 0 is invalid".to_string()));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            max_ping: self.max_ping,
            max_jitter: self.max_jitter,
            min_download: self.min_download,
            min_upload: self.min_upload,
        }
    }
}

/// Last-used scan parameters, persisted to `settings.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub concurrency: usize,
    pub stop_after: u64,
    pub max_ping: f64,
    pub max_jitter: f64,
    pub min_download: f64,
    pub min_upload: f64,
    pub ip_version: IpVersion,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            stop_after: 10,
            max_ping: 1000.0,
            max_jitter: 500.0,
            min_download: 0.1,
            min_upload: 0.1,
            ip_version: IpVersion::Ipv4,
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults on any problem
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn from_params(params: &ScanParams) -> Self {
        Self {
            concurrency: params.concurrency,
            stop_after: params.stop_after,
            max_ping: params.max_ping,
            max_jitter: params.max_jitter,
            min_download: params.min_download,
            min_upload: params.min_upload,
            ip_version: params.ip_version,
        }
    }
}

/// Application directory layout
///
/// Everything EdgeScan persists lives under one directory
/// (`~/.edgescan` by default): settings, the task store, the offline
/// result cache, per-probe tunnel configs, and the proxy-core binary tree.
#[derive(Debug, Clone)]
pub struct AppDirs {
    root: PathBuf,
}

impl AppDirs {
    /// Resolve the application directory, creating it if necessary
    pub fn init(override_root: Option<PathBuf>) -> Result<Self> {
        let root = match override_root {
            Some(p) => p,
            None => dirs::home_dir()
                .ok_or_else(|| Error::Config("cannot determine home directory".to_string()))?
                .join(".edgescan"),
        };
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join("results"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    pub fn task_store_db(&self) -> PathBuf {
        self.root.join("scan_queue.db")
    }

    pub fn offline_cache_db(&self) -> PathBuf {
        self.root.join("offline_cache.db")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn core_dir(&self) -> PathBuf {
        self.root.join("xray_core")
    }
}
