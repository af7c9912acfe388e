//! Scan scheduler
//!
//! Feeds candidates into bounded concurrency and owns the scan lifecycle.
//! Two gates are live for the whole scan:
//!
//! - the **discovery semaphore** (permits = 5 × concurrency) bounds probes in
//!   flight — cheap work dominated by the TCP pre-filter;
//! - the **throughput semaphore** (permits = concurrency) bounds simultaneous
//!   bandwidth measurements inside the probe pipeline, which saturate the
//!   uplink and would otherwise contend with each other.
//!
//! Pause spins the loop, stop is soft (in-flight probes observe the status
//! and abort), and the `found_good >= stop_after` early exit is checked both
//! here and in each worker after a good result is recorded.

use crate::geo::GeoResolver;
use crate::persistence::ResultPersistence;
use crate::probe::{Candidate, ProbeOptions, ProbeRunner};
use crate::registry::{JobHandle, PAUSE_POLL};
use crate::task_store::TaskStore;
use crate::SmartIpGenerator;
use chrono::Utc;
use edgescan_core::{
    IpVersion, OutcomeStatus, ProbeOutcome, ProxyUri, ResultRecord, ScanParams, ScanStatus,
    UserInfo,
};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Safety ceiling on dynamically generated candidates per scan
pub const GENERATION_CEILING: usize = 100_000;

/// Scheduler tick between spawn rounds
const SCHEDULER_TICK: Duration = Duration::from_millis(100);

/// Task-store flush interval for running jobs
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Where one scan's candidates come from
pub enum CandidateFeed {
    /// Fixed list, each entry consumed exactly once
    Static { items: Vec<Candidate>, index: usize },
    /// Unbounded generation, capped by the safety ceiling
    Generated {
        generator: Arc<SmartIpGenerator>,
        family: IpVersion,
        ports: Vec<u16>,
        issued: usize,
        ceiling: usize,
    },
}

impl CandidateFeed {
    /// Static feed from plain addresses, cross-multiplied with `test_ports`
    pub fn from_ips(ips: Vec<IpAddr>, ports: &[u16]) -> Self {
        let items = if ports.is_empty() {
            ips.into_iter().map(Candidate::plain).collect()
        } else {
            ips.into_iter()
                .flat_map(|ip| ports.iter().map(move |port| Candidate::with_port(ip, *port)))
                .collect()
        };
        CandidateFeed::Static { items, index: 0 }
    }

    /// Static feed from prebuilt candidates (advanced-scan variants)
    pub fn from_candidates(items: Vec<Candidate>) -> Self {
        CandidateFeed::Static { items, index: 0 }
    }

    /// Dynamic feed over a range set
    pub fn generated(ranges: Vec<IpNetwork>, family: IpVersion, ports: Vec<u16>) -> Self {
        CandidateFeed::Generated {
            generator: Arc::new(SmartIpGenerator::new(ranges)),
            family,
            ports,
            issued: 0,
            ceiling: GENERATION_CEILING,
        }
    }

    /// Number of candidates when the feed is static
    pub fn total_known(&self) -> Option<u64> {
        match self {
            CandidateFeed::Static { items, .. } => Some(items.len() as u64),
            CandidateFeed::Generated { .. } => None,
        }
    }

    /// The generator behind a dynamic feed, for success feedback
    pub fn generator(&self) -> Option<Arc<SmartIpGenerator>> {
        match self {
            CandidateFeed::Generated { generator, .. } => Some(generator.clone()),
            CandidateFeed::Static { .. } => None,
        }
    }

    fn next(&mut self) -> Option<Candidate> {
        match self {
            CandidateFeed::Static { items, index } => {
                let candidate = items.get(*index).cloned()?;
                *index += 1;
                Some(candidate)
            }
            CandidateFeed::Generated {
                generator,
                family,
                ports,
                issued,
                ceiling,
            } => {
                if *issued >= *ceiling {
                    return None;
                }
                let ip = generator.draw(*family);
                let port = if ports.is_empty() {
                    None
                } else {
                    Some(ports[*issued % ports.len()])
                };
                *issued += 1;
                Some(Candidate {
                    ip,
                    port,
                    variant: Default::default(),
                })
            }
        }
    }
}

/// Everything one scan run needs
pub struct ScanContext {
    pub handle: Arc<JobHandle>,
    pub proxy: ProxyUri,
    pub params: ScanParams,
    pub user: UserInfo,
    pub feed: CandidateFeed,
}

struct WorkerShared {
    handle: Arc<JobHandle>,
    runner: Arc<dyn ProbeRunner>,
    proxy: ProxyUri,
    opts: ProbeOptions,
    discovery: Arc<Semaphore>,
    generator: Option<Arc<SmartIpGenerator>>,
    geo: Arc<GeoResolver>,
    persistence: Option<Arc<ResultPersistence>>,
    user: UserInfo,
    stop_after: u64,
    target_country: Option<String>,
    source_tag: String,
    provider: String,
    app_version: String,
}

/// Orchestrates scan jobs over a probe runner
///
/// The runner is a trait object so tests can drive the scheduler with
/// scripted probes instead of real tunnels.
pub struct ScanScheduler {
    runner: Arc<dyn ProbeRunner>,
    geo: Arc<GeoResolver>,
    persistence: Option<Arc<ResultPersistence>>,
    task_store: Option<Arc<TaskStore>>,
    results_dir: Option<PathBuf>,
}

impl ScanScheduler {
    pub fn new(runner: Arc<dyn ProbeRunner>) -> Self {
        Self {
            runner,
            geo: Arc::new(GeoResolver::disabled()),
            persistence: None,
            task_store: None,
            results_dir: None,
        }
    }

    /// Enable geo enrichment of good results
    pub fn with_geo(mut self, geo: Arc<GeoResolver>) -> Self {
        self.geo = geo;
        self
    }

    /// Enable the result-persistence cascade
    pub fn with_persistence(mut self, persistence: Arc<ResultPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Enable the durable task store
    pub fn with_task_store(mut self, store: Arc<TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    /// Dump good results to `<dir>/scan_<id>.json` on completion
    pub fn with_results_dir(mut self, dir: PathBuf) -> Self {
        self.results_dir = Some(dir);
        self
    }

    /// Run one scan job to its terminal state
    pub async fn run(&self, ctx: ScanContext) {
        let handle = ctx.handle.clone();
        handle.set_status(ScanStatus::Running);

        let flusher = self.task_store.as_ref().map(|store| {
            let store = store.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(FLUSH_INTERVAL).await;
                    let snapshot = handle.snapshot();
                    let terminal = snapshot.status.is_terminal();
                    if let Err(e) = store.update_job(&snapshot).await {
                        warn!("task store flush failed: {}", e);
                    }
                    if terminal {
                        break;
                    }
                }
            })
        });

        if let Err(e) = self.run_inner(ctx).await {
            error!("scan {} failed: {}", handle.id, e);
            handle.add_log(format!("CRITICAL ERROR: {}", e));
            handle.set_status(ScanStatus::Failed);
        }

        // Completed unless a terminal state (stopped/failed) was already set
        handle.set_status(ScanStatus::Completed);
        handle.add_log("Scan finished.");
        info!("scan {} finished as {}", handle.id, handle.status());

        self.dump_good_results(&handle).await;

        if let Some(store) = &self.task_store {
            if let Err(e) = store.update_job(&handle.snapshot()).await {
                warn!("final task store write failed: {}", e);
            }
        }
        if let Some(flusher) = flusher {
            flusher.abort();
        }
    }

    async fn run_inner(&self, ctx: ScanContext) -> edgescan_core::Result<()> {
        let ScanContext {
            handle,
            proxy,
            params,
            user,
            mut feed,
        } = ctx;
        params.validate()?;

        let concurrency = params.concurrency;
        let window = concurrency * 5;
        let discovery = Arc::new(Semaphore::new(window));
        let throughput = Arc::new(Semaphore::new(concurrency));

        let mode = match feed.total_known() {
            Some(total) => {
                handle.set_total(total);
                "Static list"
            }
            None => "Smart discovery",
        };
        handle.add_log(format!(
            "Started scan. Goal: find {} good IPs. Concurrency: {}. Mode: {}",
            params.stop_after, concurrency, mode
        ));

        let shared = Arc::new(WorkerShared {
            handle: handle.clone(),
            runner: self.runner.clone(),
            proxy: proxy.clone(),
            opts: ProbeOptions {
                thresholds: params.thresholds(),
                verify_tls: params.verify_tls,
                fastly: params.ip_source.is_fastly(),
                throughput,
            },
            discovery,
            generator: feed.generator(),
            geo: self.geo.clone(),
            persistence: self.persistence.clone(),
            user,
            stop_after: params.stop_after,
            target_country: params.target_country.clone(),
            source_tag: if params.manual_ips.is_empty() {
                params.ip_source.tag().to_string()
            } else {
                "manual".to_string()
            },
            provider: if params.ip_source.is_fastly() {
                "fastly".to_string()
            } else {
                "cloudflare".to_string()
            },
            app_version: params.app_version.clone(),
        });

        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            match handle.status() {
                ScanStatus::Running => {}
                ScanStatus::Paused => {
                    tokio::time::sleep(PAUSE_POLL).await;
                    continue;
                }
                _ => break,
            }

            if handle.found_good() >= params.stop_after {
                handle.set_status(ScanStatus::Completed);
                break;
            }

            let mut exhausted = false;
            while tasks.len() < window {
                match feed.next() {
                    Some(candidate) => {
                        let shared = shared.clone();
                        tasks.spawn(async move { worker(shared, candidate).await });
                    }
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }

            // Reap finished workers without blocking the spawn loop
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    warn!("probe worker panicked: {}", e);
                }
            }

            if exhausted && tasks.is_empty() {
                break;
            }

            tokio::time::sleep(SCHEDULER_TICK).await;
        }

        // Soft drain: stopped scans wait for in-flight probes to observe the
        // status and abort rather than killing them
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("probe worker panicked: {}", e);
            }
        }

        Ok(())
    }

    async fn dump_good_results(&self, handle: &JobHandle) {
        let Some(dir) = &self.results_dir else {
            return;
        };
        let snapshot = handle.snapshot();
        let good: Vec<&ProbeOutcome> = snapshot
            .results
            .iter()
            .filter(|r| r.status == OutcomeStatus::Ok)
            .collect();
        if good.is_empty() {
            return;
        }
        let path = dir.join(format!("scan_{}.json", handle.id));
        match serde_json::to_vec_pretty(&good) {
            Ok(body) => {
                if let Err(e) = tokio::fs::write(&path, body).await {
                    warn!("failed to write {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("failed to serialize results: {}", e),
        }
    }
}

async fn worker(shared: Arc<WorkerShared>, candidate: Candidate) {
    let Ok(_permit) = shared.discovery.clone().acquire_owned().await else {
        return;
    };
    if shared.handle.status().is_terminal() {
        return;
    }

    shared
        .handle
        .add_log(format!("Checking {}...", candidate.endpoint_label()));

    let mut outcome = shared
        .runner
        .probe(&candidate, &shared.proxy, &shared.opts, &shared.handle)
        .await;

    if outcome.status == OutcomeStatus::Abort {
        debug!("probe of {} aborted", candidate.endpoint_label());
        return;
    }

    if outcome.status == OutcomeStatus::Ok {
        let enriched = shared.geo.enrich(&outcome.ip).await;
        let geo_rejected = shared
            .target_country
            .as_ref()
            .is_some_and(|want| !enriched.country.eq_ignore_ascii_case(want));

        if geo_rejected {
            outcome.status = OutcomeStatus::WrongGeo;
            outcome.link.clear();
        } else {
            outcome.location = enriched.location;
            outcome.asn = enriched.asn;
            if let Some(generator) = &shared.generator {
                generator.report_success(candidate.ip);
            }
            shared.handle.add_log(format!(
                "GOOD IP FOUND: {} (Ping: {}ms, DL: {} Mbps)",
                outcome.ip, outcome.ping_ms, outcome.down_mbps
            ));
            let found = shared.handle.incr_found_good();
            if found >= shared.stop_after && shared.handle.set_status(ScanStatus::Completed) {
                shared.handle.add_log("Target reached. Stopping scan.");
            }
        }
    }

    if outcome.status != OutcomeStatus::Ok {
        shared.handle.add_log(format!(
            "Failed {}: {}",
            candidate.endpoint_label(),
            outcome.status
        ));
    }

    // Fire-and-forget persistence; a slow cascade must never hold a worker
    if let Some(persistence) = &shared.persistence {
        let record = build_record(&shared, &candidate, &outcome);
        let persistence = persistence.clone();
        tokio::spawn(async move {
            persistence.save_scan_result(&record).await;
        });
    }

    shared.handle.record_outcome(outcome);
}

fn build_record(shared: &WorkerShared, candidate: &Candidate, outcome: &ProbeOutcome) -> ResultRecord {
    ResultRecord {
        timestamp: Utc::now(),
        user_ip: shared.user.ip.clone(),
        user_location: shared.user.location.clone(),
        user_isp: shared.user.isp.clone(),
        credential_id: shared.proxy.credential.clone(),
        scanned_ip: outcome.ip.clone(),
        source_tag: shared.source_tag.clone(),
        ping: outcome.ping_ms,
        jitter: outcome.jitter_ms,
        download: outcome.down_mbps,
        upload: outcome.up_mbps,
        status: outcome.status.to_string(),
        datacenter: outcome.datacenter.clone(),
        asn: if outcome.asn.is_empty() {
            "Unknown".to_string()
        } else {
            outcome.asn.clone()
        },
        net_type: shared.proxy.net_type(),
        port: candidate.port.unwrap_or(shared.proxy.port) as i32,
        sni: shared.proxy.sni(),
        provider: shared.provider.clone(),
        app_version: shared.app_version.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_feed_cross_product() {
        let ip: IpAddr = "198.51.100.1".parse().unwrap();
        let mut feed = CandidateFeed::from_ips(vec![ip], &[443, 80, 8443]);
        assert_eq!(feed.total_known(), Some(3));

        let ports: Vec<u16> = std::iter::from_fn(|| feed.next())
            .map(|c| c.port.unwrap())
            .collect();
        assert_eq!(ports, vec![443, 80, 8443]);
        assert!(feed.next().is_none());
    }

    #[test]
    fn test_static_feed_no_ports() {
        let ips: Vec<IpAddr> = vec!["1.1.1.1".parse().unwrap(), "1.0.0.1".parse().unwrap()];
        let mut feed = CandidateFeed::from_ips(ips, &[]);
        assert_eq!(feed.total_known(), Some(2));
        assert_eq!(feed.next().unwrap().port, None);
    }

    #[test]
    fn test_generated_feed_cycles_ports() {
        let ranges = vec!["104.16.0.0/13".parse().unwrap()];
        let mut feed = CandidateFeed::generated(ranges, IpVersion::Ipv4, vec![443, 2053]);
        assert_eq!(feed.total_known(), None);
        assert!(feed.generator().is_some());

        let first = feed.next().unwrap();
        let second = feed.next().unwrap();
        let third = feed.next().unwrap();
        assert_eq!(first.port, Some(443));
        assert_eq!(second.port, Some(2053));
        assert_eq!(third.port, Some(443));
    }

    #[test]
    fn test_generated_feed_hits_ceiling() {
        let ranges = vec!["198.51.100.0/24".parse().unwrap()];
        let mut feed = CandidateFeed::generated(ranges, IpVersion::Ipv4, vec![]);
        if let CandidateFeed::Generated { ceiling, .. } = &mut feed {
            *ceiling = 5;
        }
        let drawn: Vec<_> = std::iter::from_fn(|| feed.next()).collect();
        assert_eq!(drawn.len(), 5);
    }
}
