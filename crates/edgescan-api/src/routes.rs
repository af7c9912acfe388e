//! REST endpoint table and handlers
//!
//! The surface the desktop front-end talks to. Scans are started here and
//! handed to the scheduler as background tasks; everything else reads
//! registry snapshots or mutates job status through the registry.

use crate::export::{self, ExportFormat};
use crate::state::AppState;
use crate::subscription;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use edgescan_core::{OutcomeStatus, ProxyUri, ScanParams, Settings};
use edgescan_scanner::scheduler::{CandidateFeed, ScanContext};
use edgescan_scanner::sources::ResolvedSource;
use edgescan_scanner::{Candidate, FragmentPolicy, JobHandle, TunnelVariant};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/my-ip", get(my_ip))
        .route("/settings", get(get_settings).post(set_settings))
        .route("/fetch-config", post(fetch_config))
        .route("/scan", post(start_scan))
        .route("/scan/{id}", get(scan_status))
        .route("/scan/{id}/pause", post(pause_scan))
        .route("/scan/{id}/resume", post(resume_scan))
        .route("/scan/{id}/stop", post(stop_scan))
        .route("/scan-advanced", post(start_advanced_scan))
        .route("/export", post(export_results))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn my_ip(State(state): State<Arc<AppState>>) -> Json<Value> {
    let user = state.geo.my_ip().await;
    Json(json!({ "ip": user.ip, "location": user.location, "isp": user.isp }))
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Settings> {
    Json(Settings::load(&state.settings_path))
}

async fn set_settings(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<Settings>,
) -> Response {
    match settings.save(&state.settings_path) {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Deserialize)]
struct FetchConfigRequest {
    url: String,
}

async fn fetch_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FetchConfigRequest>,
) -> Response {
    match subscription::fetch_subscription(&state.client, &req.url).await {
        Ok(configs) if !configs.is_empty() => {
            Json(json!({ "configs": configs })).into_response()
        }
        Ok(_) => error_response(
            StatusCode::NOT_FOUND,
            "No proxy configs found in the link.",
        ),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn start_scan(
    State(state): State<Arc<AppState>>,
    Json(params): Json<ScanParams>,
) -> Response {
    if let Err(e) = params.validate() {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    // Remember the last-used knobs for the next session
    if let Err(e) = Settings::from_params(&params).save(&state.settings_path) {
        warn!("failed to persist settings: {}", e);
    }

    let handle = Arc::new(JobHandle::new(Uuid::new_v4(), params.ip_count));
    let scan_id = handle.id;
    state.registry.insert(handle.clone());

    if let Some(store) = &state.task_store {
        if let Err(e) = store.create_job(&handle.snapshot(), &params).await {
            warn!("failed to create task row: {}", e);
        }
    }

    let app = state.clone();
    tokio::spawn(async move {
        let user = app.geo.my_ip().await;
        let (source, logs) = app
            .sources
            .resolve(&params, &user, app.persistence.as_deref())
            .await;
        for line in logs {
            handle.add_log(line);
        }

        let feed = match source {
            ResolvedSource::Static(ips) => CandidateFeed::from_ips(ips, &params.test_ports),
            ResolvedSource::Ranges(ranges) => {
                CandidateFeed::generated(ranges, params.ip_version, params.test_ports.clone())
            }
        };

        let proxy = ProxyUri::parse(&params.vless_config);
        app.scheduler
            .run(ScanContext {
                handle,
                proxy,
                params,
                user,
                feed,
            })
            .await;
    });

    info!("scan {} accepted", scan_id);
    Json(json!({ "scan_id": scan_id })).into_response()
}

async fn scan_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let Some(handle) = state.registry.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, "Scan not found");
    };
    let snapshot = handle.snapshot();

    // Only good results, fastest first
    let mut results: Vec<_> = snapshot
        .results
        .iter()
        .filter(|r| r.status == OutcomeStatus::Ok)
        .cloned()
        .collect();
    results.sort_by(|a, b| {
        a.ping_ms
            .partial_cmp(&b.ping_ms)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Json(json!({
        "status": {
            "status": snapshot.status,
            "total": snapshot.total,
            "completed": snapshot.completed,
            "found_good": snapshot.found_good,
            "logs": snapshot.logs,
            "stats": snapshot.stats,
        },
        "results": results,
    }))
    .into_response()
}

async fn pause_scan(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    scan_action(&state, &id, "paused", |s, id| s.registry.pause(id))
}

async fn resume_scan(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    scan_action(&state, &id, "running", |s, id| s.registry.resume(id))
}

async fn stop_scan(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    scan_action(&state, &id, "stopped", |s, id| s.registry.stop(id))
}

fn scan_action(
    state: &Arc<AppState>,
    id: &Uuid,
    label: &str,
    action: impl Fn(&Arc<AppState>, &Uuid) -> bool,
) -> Response {
    if state.registry.get(id).is_none() {
        return error_response(StatusCode::NOT_FOUND, "Scan not found");
    }
    if action(state, id) {
        Json(json!({ "status": label })).into_response()
    } else {
        error_response(StatusCode::CONFLICT, "Status change not allowed")
    }
}

fn default_adv_concurrency() -> usize {
    5
}

fn default_adv_max_ping() -> f64 {
    2000.0
}

/// Advanced scan: one IP, varied fragmentation / SNI / DNS settings
#[derive(Debug, Deserialize)]
pub struct AdvancedScanRequest {
    pub vless_config: String,
    pub target_ip: String,
    #[serde(default)]
    pub fragment_lengths: Vec<String>,
    #[serde(default)]
    pub fragment_intervals: Vec<String>,
    #[serde(default)]
    pub test_snis: Vec<String>,
    /// `dnstt` or `split`
    #[serde(default)]
    pub test_mode: Option<String>,
    #[serde(default)]
    pub nameserver: Option<String>,
    #[serde(default)]
    pub dns_domain: Option<String>,
    #[serde(default)]
    pub fragment_size: Option<String>,
    #[serde(default)]
    pub fragment_interval: Option<String>,
    /// `tlshello` or a packet range like `1-3`
    #[serde(default)]
    pub fragment_packets: Option<String>,
    #[serde(default)]
    pub utls_fingerprint: Option<String>,
    #[serde(default = "default_adv_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_adv_max_ping")]
    pub max_ping: f64,
}

/// Expand an advanced request into the tunnel-variant matrix
pub fn build_variants(req: &AdvancedScanRequest) -> Vec<TunnelVariant> {
    let mut variants = Vec::new();

    for length in &req.fragment_lengths {
        for interval in &req.fragment_intervals {
            variants.push(TunnelVariant {
                label: format!("Frag: {} / {}", length, interval),
                fragment: Some(FragmentPolicy {
                    packets: req
                        .fragment_packets
                        .clone()
                        .unwrap_or_else(|| "tlshello".to_string()),
                    length: length.clone(),
                    interval: interval.clone(),
                }),
                ..Default::default()
            });
        }
    }

    for sni in &req.test_snis {
        let sni = sni.trim();
        if sni.is_empty() {
            continue;
        }
        variants.push(TunnelVariant {
            label: format!("SNI: {}", sni),
            sni_override: Some(sni.to_string()),
            ..Default::default()
        });
    }

    match req.test_mode.as_deref() {
        Some("dnstt") => {
            let nameserver = req
                .nameserver
                .clone()
                .unwrap_or_else(|| "1.1.1.1".to_string());
            let label = match &req.dns_domain {
                Some(domain) => format!("DNS: {} via {}", domain, nameserver),
                None => format!("DNS: {}", nameserver),
            };
            variants.push(TunnelVariant {
                label,
                dns_nameserver: Some(nameserver),
                ..Default::default()
            });
        }
        Some("split") => {
            let length = req
                .fragment_size
                .clone()
                .unwrap_or_else(|| "10-20".to_string());
            let interval = req
                .fragment_interval
                .clone()
                .unwrap_or_else(|| "10-20".to_string());
            variants.push(TunnelVariant {
                label: format!("Split: {} / {}", length, interval),
                fragment: Some(FragmentPolicy {
                    packets: req
                        .fragment_packets
                        .clone()
                        .unwrap_or_else(|| "tlshello".to_string()),
                    length,
                    interval,
                }),
                ..Default::default()
            });
        }
        _ => {}
    }

    if let Some(fp) = &req.utls_fingerprint {
        for variant in &mut variants {
            variant.utls_fingerprint = Some(fp.clone());
        }
    }

    variants
}

async fn start_advanced_scan(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AdvancedScanRequest>,
) -> Response {
    let Ok(target_ip) = req.target_ip.parse::<IpAddr>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid target IP");
    };
    let variants = build_variants(&req);
    if variants.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Nothing to test");
    }

    let candidates: Vec<Candidate> = variants
        .into_iter()
        .map(|variant| Candidate {
            ip: target_ip,
            port: None,
            variant,
        })
        .collect();
    let total = candidates.len() as u64;

    // Thresholds are wide open except ping: advanced scans compare
    // reachability of variants, not bandwidth
    let params: ScanParams = match serde_json::from_value(json!({
        "vless_config": req.vless_config,
        "manual_ips": [target_ip.to_string()],
        "concurrency": req.concurrency.max(1),
        "stop_after": total,
        "max_ping": req.max_ping,
        "max_jitter": 10_000.0,
        "min_download": 0.0,
        "min_upload": 0.0,
    })) {
        Ok(params) => params,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let handle = Arc::new(JobHandle::new(Uuid::new_v4(), total));
    let scan_id = handle.id;
    handle.add_log(format!(
        "Started advanced scan against {} ({} variants)",
        target_ip, total
    ));
    state.registry.insert(handle.clone());

    let app = state.clone();
    tokio::spawn(async move {
        let proxy = ProxyUri::parse(&params.vless_config);
        app.scheduler
            .run(ScanContext {
                handle,
                proxy,
                params,
                user: Default::default(),
                feed: CandidateFeed::from_candidates(candidates),
            })
            .await;
    });

    Json(json!({ "scan_id": scan_id })).into_response()
}

#[derive(Deserialize)]
struct ExportRequest {
    format: ExportFormat,
    vless_config: String,
    ips: Vec<String>,
}

async fn export_results(Json(req): Json<ExportRequest>) -> Response {
    let proxy = ProxyUri::parse(&req.vless_config);
    match export::export(req.format, &proxy, &req.ips) {
        Ok(data) => Json(json!({ "data": data })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let internet = state
        .client
        .get("http://cp.cloudflare.com/generate_204")
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false);

    let (database, via_proxy, db_mode) = match &state.persistence {
        Some(persistence) => {
            let mode = persistence.mode();
            (
                mode != edgescan_scanner::PersistMode::Offline,
                mode == edgescan_scanner::PersistMode::Tunnel,
                mode.to_string(),
            )
        }
        None => (false, false, "offline".to_string()),
    };

    Json(json!({
        "internet": internet,
        "database": database,
        "via_proxy": via_proxy,
        "db_mode": db_mode,
    }))
}
