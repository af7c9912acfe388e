//! EdgeScan core library
//!
//! Shared leaf crate for the EdgeScan workspace. Holds the pieces every other
//! crate depends on:
//!
//! - [`error`]: workspace error type and `Result` alias
//! - [`types`]: probe outcome taxonomy, scan status machine, result records
//! - [`config`]: scan parameters, thresholds, persisted settings, app dirs
//! - [`proxy`]: VLESS/Trojan URI parsing, typed transport/security views,
//!   and endpoint reconstruction

pub mod config;
pub mod error;
pub mod proxy;
pub mod types;

pub use config::{AppDirs, IpSource, IpVersion, ScanParams, Settings, Thresholds};
pub use error::{Error, Result};
pub use proxy::{ProxyScheme, ProxyUri, Security, Transport};
pub use types::{
    EnrichedIp, JobSnapshot, OutcomeStats, ProbeOutcome, OutcomeStatus, ResultRecord, ScanStatus,
    UserInfo,
};
