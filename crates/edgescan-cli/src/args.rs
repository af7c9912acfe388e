//! CLI argument parsing

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// EdgeScan - CDN edge endpoint quality scanner
///
/// Serves the localhost REST API the desktop front-end talks to. Candidate
/// IPs are probed through an external xray-compatible core using a
/// user-supplied VLESS or Trojan proxy config.
#[derive(Parser, Debug)]
#[command(
    name = "edgescan",
    version,
    about = "CDN edge endpoint quality scanner",
    long_about = "EdgeScan probes CDN candidate IPs through a VLESS/Trojan tunnel and\n\
                  measures latency, jitter, and throughput. Endpoints that pass the\n\
                  configured thresholds are surfaced as good IPs.\n\n\
                  The scanner needs an xray-compatible core binary; place it next to\n\
                  this executable, under <app-dir>/xray_core/, or point --xray-path at it."
)]
pub struct Args {
    /// Address the REST API listens on
    #[arg(long, default_value = "127.0.0.1:8787")]
    pub listen: SocketAddr,

    /// Serve on a non-loopback address (NOT recommended; the API has no auth)
    #[arg(long)]
    pub allow_remote: bool,

    /// Application directory (default: ~/.edgescan)
    #[arg(long, value_name = "DIR")]
    pub app_dir: Option<PathBuf>,

    /// Explicit path to the proxy-core binary
    #[arg(long, value_name = "FILE")]
    pub xray_path: Option<PathBuf>,

    /// Log filter (tracing EnvFilter syntax)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Remote result database host (layer 1 of the persistence cascade)
    #[arg(long, value_name = "HOST")]
    pub db_host: Option<String>,

    /// Remote result database port
    #[arg(long, default_value_t = 3306)]
    pub db_port: u16,

    /// Remote result database user
    #[arg(long, default_value = "edgescan")]
    pub db_user: String,

    /// Remote result database password
    #[arg(long, default_value = "", hide_default_value = true)]
    pub db_password: String,

    /// Remote result database name
    #[arg(long, default_value = "edgescan")]
    pub db_name: String,

    /// REST shim base URL (persistence layers 2 and 3)
    #[arg(long, value_name = "URL")]
    pub shim_url: Option<String>,

    /// API key for the REST shim
    #[arg(long, default_value = "", hide_default_value = true)]
    pub shim_api_key: String,

    /// Proxy URI for the tunneled database forward (persistence layer 4)
    #[arg(long, value_name = "URI")]
    pub tunnel_proxy: Option<String>,
}
