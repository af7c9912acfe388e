//! Core types for CDN edge scanning

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Terminal classification of a single probe
///
/// Every probe returns exactly one of these; they are verdicts, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Passed every threshold; a reconstructed proxy link was emitted
    Ok,
    /// Average ping above `max_ping` (after the grace retry)
    HighPing,
    /// Jitter above `max_jitter` (after the grace retry)
    HighJitter,
    /// Best-of-two download below `min_download`
    LowDownload,
    /// Best-of-two upload below `min_upload`
    LowUpload,
    /// TCP pre-filter failed or the tunnel never warmed up
    Unreachable,
    /// Tunnel came up but no ping sample survived
    Timeout,
    /// TLS identity verification rejected the certificate
    Compromised,
    /// Passed the thresholds but failed the target-country filter
    WrongGeo,
    /// Anything that does not fit the taxonomy above
    Error,
    /// The probe observed a terminal scan status and bailed out
    Abort,
}

impl OutcomeStatus {
    /// Whether this outcome counts toward `found_good`
    pub fn is_good(&self) -> bool {
        matches!(self, OutcomeStatus::Ok)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeStatus::Ok => "ok",
            OutcomeStatus::HighPing => "high_ping",
            OutcomeStatus::HighJitter => "high_jitter",
            OutcomeStatus::LowDownload => "low_download",
            OutcomeStatus::LowUpload => "low_upload",
            OutcomeStatus::Unreachable => "unreachable",
            OutcomeStatus::Timeout => "timeout",
            OutcomeStatus::Compromised => "compromised",
            OutcomeStatus::WrongGeo => "wrong_geo",
            OutcomeStatus::Error => "error",
            OutcomeStatus::Abort => "abort",
        };
        write!(f, "{}", s)
    }
}

/// Result of probing a single candidate endpoint
///
/// Metric fields use `-1.0` for "not measured", matching what the REST
/// surface reports for probes that failed before that stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub ip: String,
    pub port: u16,
    pub ping_ms: f64,
    pub jitter_ms: f64,
    pub down_mbps: f64,
    pub up_mbps: f64,
    pub status: OutcomeStatus,
    pub datacenter: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub asn: String,
    /// Reconstructed proxy URI pointing at this candidate (only on `ok`)
    #[serde(default)]
    pub link: String,
    /// Label of the advanced-scan variant that produced this outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tested_config: Option<String>,
}

impl ProbeOutcome {
    /// Create an outcome with no measurements yet
    pub fn new(ip: impl Into<String>, port: u16, status: OutcomeStatus) -> Self {
        Self {
            ip: ip.into(),
            port,
            ping_ms: -1.0,
            jitter_ms: -1.0,
            down_mbps: -1.0,
            up_mbps: -1.0,
            status,
            datacenter: "Unknown".to_string(),
            location: String::new(),
            asn: String::new(),
            link: String::new(),
            tested_config: None,
        }
    }
}

/// Lifecycle state of a scan job
///
/// Transition graph: queued → running ↔ paused → {completed, stopped,
/// failed}. Terminal states never transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Stopped,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Stopped | ScanStatus::Failed
        )
    }

    /// Whether the transition `self -> next` is legal
    pub fn can_transition_to(&self, next: ScanStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (ScanStatus::Queued, ScanStatus::Running) => true,
            (ScanStatus::Queued, ScanStatus::Stopped | ScanStatus::Failed) => true,
            (ScanStatus::Running, ScanStatus::Paused) => true,
            (ScanStatus::Paused, ScanStatus::Running) => true,
            (
                ScanStatus::Running | ScanStatus::Paused,
                ScanStatus::Completed | ScanStatus::Stopped | ScanStatus::Failed,
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanStatus::Queued => "queued",
            ScanStatus::Running => "running",
            ScanStatus::Paused => "paused",
            ScanStatus::Completed => "completed",
            ScanStatus::Stopped => "stopped",
            ScanStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ScanStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "queued" => Ok(ScanStatus::Queued),
            "running" => Ok(ScanStatus::Running),
            "paused" => Ok(ScanStatus::Paused),
            "completed" => Ok(ScanStatus::Completed),
            "stopped" => Ok(ScanStatus::Stopped),
            "failed" => Ok(ScanStatus::Failed),
            other => Err(crate::Error::Parse(format!("unknown scan status: {}", other))),
        }
    }
}

/// Per-scan histogram of probe outcomes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeStats {
    pub scanned: u64,
    pub high_ping: u64,
    pub high_jitter: u64,
    pub low_download: u64,
    pub low_upload: u64,
    pub timeout: u64,
    pub unreachable: u64,
    pub compromised: u64,
    pub wrong_geo: u64,
    pub error: u64,
}

impl OutcomeStats {
    /// Record one finished probe
    ///
    /// `ok` increments only `scanned`; `abort` is not counted at all.
    pub fn record(&mut self, status: OutcomeStatus) {
        if status == OutcomeStatus::Abort {
            return;
        }
        self.scanned += 1;
        match status {
            OutcomeStatus::HighPing => self.high_ping += 1,
            OutcomeStatus::HighJitter => self.high_jitter += 1,
            OutcomeStatus::LowDownload => self.low_download += 1,
            OutcomeStatus::LowUpload => self.low_upload += 1,
            OutcomeStatus::Timeout => self.timeout += 1,
            OutcomeStatus::Unreachable => self.unreachable += 1,
            OutcomeStatus::Compromised => self.compromised += 1,
            OutcomeStatus::WrongGeo => self.wrong_geo += 1,
            OutcomeStatus::Error => self.error += 1,
            OutcomeStatus::Ok | OutcomeStatus::Abort => {}
        }
    }
}

/// Identity of the user running the scan, as seen by the geo service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    pub ip: String,
    pub location: String,
    pub isp: String,
}

impl UserInfo {
    pub fn unknown() -> Self {
        Self {
            ip: "Unknown".to_string(),
            location: "Unknown".to_string(),
            isp: "Unknown".to_string(),
        }
    }
}

/// Geo enrichment of a scanned candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedIp {
    pub location: String,
    pub asn: String,
    pub country: String,
}

impl Default for EnrichedIp {
    fn default() -> Self {
        Self {
            location: "Unknown".to_string(),
            asn: "Unknown".to_string(),
            country: "Unknown".to_string(),
        }
    }
}

/// One row of the result persistence cascade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub timestamp: DateTime<Utc>,
    pub user_ip: String,
    pub user_location: String,
    pub user_isp: String,
    /// Credential of the proxy URI used for this scan (uuid or password)
    pub credential_id: String,
    pub scanned_ip: String,
    pub source_tag: String,
    pub ping: f64,
    pub jitter: f64,
    pub download: f64,
    pub upload: f64,
    pub status: String,
    pub datacenter: String,
    pub asn: String,
    pub net_type: String,
    pub port: i32,
    pub sni: String,
    pub provider: String,
    pub app_version: String,
}

/// Serializable snapshot of a scan job, shared by the REST surface and the
/// persistent task store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub status: ScanStatus,
    pub total: u64,
    pub completed: u64,
    pub found_good: u64,
    pub logs: Vec<String>,
    pub stats: OutcomeStats,
    pub results: Vec<ProbeOutcome>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(ScanStatus::Queued.can_transition_to(ScanStatus::Running));
        assert!(ScanStatus::Running.can_transition_to(ScanStatus::Paused));
        assert!(ScanStatus::Paused.can_transition_to(ScanStatus::Running));
        assert!(ScanStatus::Running.can_transition_to(ScanStatus::Completed));
        assert!(ScanStatus::Paused.can_transition_to(ScanStatus::Stopped));

        // Terminal states are sinks
        assert!(!ScanStatus::Completed.can_transition_to(ScanStatus::Running));
        assert!(!ScanStatus::Stopped.can_transition_to(ScanStatus::Paused));
        assert!(!ScanStatus::Failed.can_transition_to(ScanStatus::Queued));

        // No shortcut from queued to paused
        assert!(!ScanStatus::Queued.can_transition_to(ScanStatus::Paused));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ScanStatus::Queued,
            ScanStatus::Running,
            ScanStatus::Paused,
            ScanStatus::Completed,
            ScanStatus::Stopped,
            ScanStatus::Failed,
        ] {
            let parsed: ScanStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<ScanStatus>().is_err());
    }

    #[test]
    fn test_stats_record() {
        let mut stats = OutcomeStats::default();
        stats.record(OutcomeStatus::Ok);
        stats.record(OutcomeStatus::HighPing);
        stats.record(OutcomeStatus::Unreachable);
        stats.record(OutcomeStatus::Unreachable);
        stats.record(OutcomeStatus::Abort);

        assert_eq!(stats.scanned, 4);
        assert_eq!(stats.high_ping, 1);
        assert_eq!(stats.unreachable, 2);
        assert_eq!(stats.error, 0);
    }

    #[test]
    fn test_outcome_serde_names() {
        let json = serde_json::to_string(&OutcomeStatus::HighPing).unwrap();
        assert_eq!(json, "\"high_ping\"");
        let back: OutcomeStatus = serde_json::from_str("\"wrong_geo\"").unwrap();
        assert_eq!(back, OutcomeStatus::WrongGeo);
    }

    #[test]
    fn test_new_outcome_defaults() {
        let outcome = ProbeOutcome::new("1.1.1.1", 443, OutcomeStatus::Unreachable);
        assert_eq!(outcome.ping_ms, -1.0);
        assert_eq!(outcome.datacenter, "Unknown");
        assert!(outcome.link.is_empty());
    }
}
