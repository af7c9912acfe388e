//! Per-candidate probe pipeline
//!
//! The measurement sequence for one candidate endpoint, in strict order:
//! TCP pre-filter → optional TLS identity check → tunnel launch → warmup →
//! ping and jitter → datacenter trace → threshold check with grace →
//! throughput under the throughput semaphore → verdict. Each step can end
//! the probe early with a classified outcome; the tunnel process is always
//! terminated before the probe returns, whatever the exit path.
//!
//! Every suspension point consults the job status: paused probes spin,
//! terminal states yield the `abort` outcome.

use crate::registry::{Gate, JobHandle};
use crate::supervisor::CoreSupervisor;
use crate::tls_verify;
use crate::tunnel::{self, TunnelVariant};
use async_trait::async_trait;
use edgescan_core::{OutcomeStatus, ProbeOutcome, ProxyUri, Thresholds};
use reqwest::Client;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

const TCP_PREFILTER_TIMEOUT: Duration = Duration::from_secs(1);
const PROBE_TIMEOUT: Duration = Duration::from_secs(12);
const TRACE_TIMEOUT: Duration = Duration::from_secs(5);
const THROUGHPUT_TIMEOUT: Duration = Duration::from_secs(25);

const READY_BUDGET: Duration = Duration::from_secs(5);
const READY_POLL: Duration = Duration::from_millis(500);
const WARMUP_ATTEMPTS: usize = 5;
const WARMUP_BACKOFF: Duration = Duration::from_secs(2);
const COOLDOWN: Duration = Duration::from_millis(500);

const PING_COUNT: usize = 6;
const PING_SPACING: Duration = Duration::from_millis(200);
const GRACE_PING_COUNT: usize = 3;
/// Misses within this factor of the threshold get a second opinion
const GRACE_FACTOR: f64 = 1.1;

const CAPTIVE_PORTAL_URL: &str = "http://cp.cloudflare.com/generate_204";
const CF_TRACE_URL: &str = "http://cp.cloudflare.com/cdn-cgi/trace";
const FASTLY_TRACE_URL: &str = "http://www.fastly.com";
const DOWNLOAD_URL: &str = "http://speed.cloudflare.com/__down?bytes=1000000";
const UPLOAD_URL: &str = "http://speed.cloudflare.com/__up";
const UPLOAD_BYTES: usize = 1024 * 1024;

/// One candidate endpoint to probe
#[derive(Debug, Clone)]
pub struct Candidate {
    pub ip: IpAddr,
    /// Target port override; `None` uses the proxy URI's port
    pub port: Option<u16>,
    pub variant: TunnelVariant,
}

impl Candidate {
    pub fn plain(ip: IpAddr) -> Self {
        Self {
            ip,
            port: None,
            variant: TunnelVariant::default(),
        }
    }

    pub fn with_port(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port: Some(port),
            variant: TunnelVariant::default(),
        }
    }

    /// Label for log lines, `ip` or `ip:port`
    pub fn endpoint_label(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.ip, port),
            None => self.ip.to_string(),
        }
    }
}

/// Per-scan probe configuration
pub struct ProbeOptions {
    pub thresholds: Thresholds,
    pub verify_tls: bool,
    /// Use the Fastly trace endpoint instead of Cloudflare's
    pub fastly: bool,
    /// Gate on simultaneous throughput measurements (permits = concurrency)
    pub throughput: Arc<Semaphore>,
}

/// Seam between the scheduler and the measurement pipeline
///
/// The scheduler only depends on this trait, so tests drive it with scripted
/// stand-ins instead of real tunnels.
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    async fn probe(
        &self,
        candidate: &Candidate,
        proxy: &ProxyUri,
        opts: &ProbeOptions,
        job: &JobHandle,
    ) -> ProbeOutcome;
}

/// The real pipeline, backed by the proxy-core supervisor
pub struct ProbePipeline {
    supervisor: Arc<CoreSupervisor>,
}

impl ProbePipeline {
    pub fn new(supervisor: Arc<CoreSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl ProbeRunner for ProbePipeline {
    async fn probe(
        &self,
        candidate: &Candidate,
        proxy: &ProxyUri,
        opts: &ProbeOptions,
        job: &JobHandle,
    ) -> ProbeOutcome {
        let target_port = candidate.port.unwrap_or(proxy.port);
        let mut outcome =
            ProbeOutcome::new(candidate.ip.to_string(), target_port, OutcomeStatus::Error);
        if !candidate.variant.label.is_empty() {
            outcome.tested_config = Some(candidate.variant.label.clone());
        }

        if job.gate().await == Gate::Abort {
            outcome.status = OutcomeStatus::Abort;
            return outcome;
        }

        // 1. TCP pre-filter: drop dead candidates before paying for a tunnel
        if !tcp_prefilter(candidate.ip, target_port).await {
            outcome.status = OutcomeStatus::Unreachable;
            return outcome;
        }

        // 2. Optional TLS identity verification
        if opts.verify_tls {
            let trusted = match tls_verify::inspect_candidate(
                candidate.ip,
                target_port,
                proxy.param("sni"),
            )
            .await
            {
                Ok(identity) => identity.is_trusted(),
                Err(e) => {
                    debug!("TLS inspection of {} failed: {}", candidate.ip, e);
                    false
                }
            };
            if !trusted {
                outcome.status = OutcomeStatus::Compromised;
                return outcome;
            }
        }

        if job.gate().await == Gate::Abort {
            outcome.status = OutcomeStatus::Abort;
            return outcome;
        }

        // 3. Tunnel launch
        let socks_port = tunnel::ephemeral_socks_port();
        let config = tunnel::probe_config(
            proxy,
            &candidate.ip,
            target_port,
            socks_port,
            &candidate.variant,
        );
        let tag = format!(
            "{}_{}",
            candidate.ip.to_string().replace(':', "_"),
            socks_port
        );
        let core = match self.supervisor.launch(&config, &tag).await {
            Ok(core) => core,
            Err(e) => {
                debug!("tunnel launch for {} failed: {}", candidate.ip, e);
                outcome.status = OutcomeStatus::Unreachable;
                return outcome;
            }
        };

        let status = match socks_client(socks_port) {
            Some(client) => measure(&client, job, opts, &mut outcome).await,
            None => OutcomeStatus::Error,
        };

        // 11. Cleanup, on every path: the core never outlives the probe
        core.shutdown().await;

        outcome.status = status;
        if status == OutcomeStatus::Ok {
            outcome.link = proxy.with_endpoint(&candidate.ip, target_port);
        }
        outcome
    }
}

/// Steps 3b-10: everything that needs the live tunnel
async fn measure(
    client: &Client,
    job: &JobHandle,
    opts: &ProbeOptions,
    outcome: &mut ProbeOutcome,
) -> OutcomeStatus {
    // Readiness poll: not fatal by itself, the warmup below has its own budget
    let mut ready = false;
    let deadline = Instant::now() + READY_BUDGET;
    while Instant::now() < deadline {
        if job.gate().await == Gate::Abort {
            return OutcomeStatus::Abort;
        }
        if measure_ping(client).await.is_some() {
            ready = true;
            break;
        }
        tokio::time::sleep(READY_POLL).await;
    }

    // 4. Warmup with backoff
    if !ready {
        for _ in 0..WARMUP_ATTEMPTS {
            if job.gate().await == Gate::Abort {
                return OutcomeStatus::Abort;
            }
            if measure_ping(client).await.is_some() {
                ready = true;
                break;
            }
            tokio::time::sleep(WARMUP_BACKOFF).await;
        }
        if !ready {
            return OutcomeStatus::Unreachable;
        }
    }

    // 5. Cooldown to let TLS session state stabilize
    tokio::time::sleep(COOLDOWN).await;

    // 6. Ping and jitter; the first sample carries cold-start bias
    let Some(samples) = ping_series(client, job, PING_COUNT, true).await else {
        return OutcomeStatus::Abort;
    };
    if samples.is_empty() {
        return OutcomeStatus::Timeout;
    }
    let (mut avg, mut jitter) = series_stats(&samples);
    outcome.ping_ms = round2(avg);
    outcome.jitter_ms = round2(jitter);

    // 7. Datacenter identification; "Unknown" is fine
    outcome.datacenter = identify_datacenter(client, opts.fastly).await;

    // 8. Threshold check with grace: a near-miss on either metric earns one
    // shared re-measurement before the verdict
    let t = &opts.thresholds;
    if avg > t.max_ping || jitter > t.max_jitter {
        let ping_near_miss = avg > t.max_ping && avg <= t.max_ping * GRACE_FACTOR;
        let jitter_near_miss = jitter > t.max_jitter && jitter <= t.max_jitter * GRACE_FACTOR;
        if ping_near_miss || jitter_near_miss {
            let Some(retry) = ping_series(client, job, GRACE_PING_COUNT, false).await else {
                return OutcomeStatus::Abort;
            };
            if !retry.is_empty() {
                let (retry_avg, retry_jitter) = series_stats(&retry);
                avg = retry_avg;
                jitter = retry_jitter;
                outcome.ping_ms = round2(avg);
                outcome.jitter_ms = round2(jitter);
            }
        }
        if avg > t.max_ping {
            return OutcomeStatus::HighPing;
        }
        if jitter > t.max_jitter {
            return OutcomeStatus::HighJitter;
        }
    }

    // 9. Throughput, bounded by the throughput semaphore
    if job.gate().await == Gate::Abort {
        return OutcomeStatus::Abort;
    }
    let Ok(_permit) = opts.throughput.acquire().await else {
        return OutcomeStatus::Error;
    };
    if job.gate().await == Gate::Abort {
        return OutcomeStatus::Abort;
    }

    let down = measure_download(client).await.max(measure_download(client).await);
    outcome.down_mbps = round2(down);
    if down <= 0.0 || down < t.min_download {
        return OutcomeStatus::LowDownload;
    }

    let up = measure_upload(client).await.max(measure_upload(client).await);
    outcome.up_mbps = round2(up);
    if up <= 0.0 || up < t.min_upload {
        return OutcomeStatus::LowUpload;
    }

    // 10. Verdict
    OutcomeStatus::Ok
}

/// Collect a ping series; returns `None` when the job aborted mid-series
async fn ping_series(
    client: &Client,
    job: &JobHandle,
    count: usize,
    discard_first: bool,
) -> Option<Vec<f64>> {
    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        if job.gate().await == Gate::Abort {
            return None;
        }
        let sample = measure_ping(client).await;
        if !(discard_first && i == 0) {
            if let Some(ms) = sample {
                samples.push(ms);
            }
        }
        tokio::time::sleep(PING_SPACING).await;
    }
    Some(samples)
}

fn series_stats(samples: &[f64]) -> (f64, f64) {
    let avg = samples.iter().sum::<f64>() / samples.len() as f64;
    let max = samples.iter().cloned().fold(f64::MIN, f64::max);
    let min = samples.iter().cloned().fold(f64::MAX, f64::min);
    (avg, max - min)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Full TCP handshake against the candidate, 1 s budget
async fn tcp_prefilter(ip: IpAddr, port: u16) -> bool {
    matches!(
        tokio::time::timeout(TCP_PREFILTER_TIMEOUT, TcpStream::connect((ip, port))).await,
        Ok(Ok(_))
    )
}

/// HTTP client routed through the probe's local SOCKS endpoint
fn socks_client(socks_port: u16) -> Option<Client> {
    let proxy = reqwest::Proxy::all(format!("socks5://127.0.0.1:{}", socks_port)).ok()?;
    Client::builder()
        .proxy(proxy)
        .timeout(PROBE_TIMEOUT)
        .build()
        .ok()
}

/// One captive-portal round trip; `Some(ms)` on 200/204
async fn measure_ping(client: &Client) -> Option<f64> {
    let start = Instant::now();
    match client.get(CAPTIVE_PORTAL_URL).send().await {
        Ok(resp) if resp.status().as_u16() == 204 || resp.status().as_u16() == 200 => {
            Some(start.elapsed().as_secs_f64() * 1000.0)
        }
        Ok(resp) => {
            trace!("captive portal returned {}", resp.status());
            None
        }
        Err(_) => None,
    }
}

/// Download 1 MB and report megabits per second; 0.0 on failure
async fn measure_download(client: &Client) -> f64 {
    let start = Instant::now();
    let result = client
        .get(DOWNLOAD_URL)
        .timeout(THROUGHPUT_TIMEOUT)
        .send()
        .await;
    match result {
        Ok(resp) if resp.status().is_success() => match resp.bytes().await {
            Ok(_) => {
                let secs = start.elapsed().as_secs_f64();
                if secs > 0.0 {
                    8.0 / secs
                } else {
                    0.0
                }
            }
            Err(_) => 0.0,
        },
        _ => 0.0,
    }
}

/// Upload 1 MiB and report megabits per second; 0.0 on failure
async fn measure_upload(client: &Client) -> f64 {
    let body = vec![0u8; UPLOAD_BYTES];
    let start = Instant::now();
    let result = client
        .post(UPLOAD_URL)
        .timeout(THROUGHPUT_TIMEOUT)
        .body(body)
        .send()
        .await;
    match result {
        Ok(resp) if resp.status().as_u16() < 400 => {
            let secs = start.elapsed().as_secs_f64();
            if secs > 0.0 {
                8.0 / secs
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

/// PoP code of the edge this tunnel landed on
async fn identify_datacenter(client: &Client, fastly: bool) -> String {
    if fastly {
        // Fastly exposes the serving PoP in the x-served-by header
        let resp = client
            .get(FASTLY_TRACE_URL)
            .timeout(TRACE_TIMEOUT)
            .send()
            .await;
        if let Ok(resp) = resp {
            if let Some(served_by) = resp
                .headers()
                .get("x-served-by")
                .and_then(|v| v.to_str().ok())
            {
                if let Some(pop) = parse_fastly_pop(served_by) {
                    return pop;
                }
            }
        }
    } else {
        let resp = client
            .get(CF_TRACE_URL)
            .timeout(TRACE_TIMEOUT)
            .send()
            .await;
        if let Ok(resp) = resp {
            if let Ok(body) = resp.text().await {
                if let Some(colo) = parse_cf_colo(&body) {
                    return colo;
                }
            }
        }
    }
    "Unknown".to_string()
}

fn parse_cf_colo(trace_body: &str) -> Option<String> {
    trace_body
        .lines()
        .find_map(|line| line.strip_prefix("colo="))
        .map(|colo| colo.trim().to_string())
        .filter(|colo| !colo.is_empty())
}

fn parse_fastly_pop(served_by: &str) -> Option<String> {
    // e.g. "cache-bfi-krnt7300042-BFI, cache-lax-kwhp1940043-LAX"
    served_by
        .split(',')
        .next_back()?
        .trim()
        .rsplit('-')
        .next()
        .map(|pop| pop.to_string())
        .filter(|pop| !pop.is_empty())
}
