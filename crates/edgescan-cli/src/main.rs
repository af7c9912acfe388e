//! EdgeScan server binary
//!
//! Wires the scan engine together and serves the localhost REST API:
//! application directories, task-store recovery, the persistence cascade,
//! the daily range refresher, and the axum listener.

mod args;

use anyhow::{bail, Context, Result};
use args::Args;
use clap::Parser;
use edgescan_api::AppState;
use edgescan_core::AppDirs;
use edgescan_scanner::persistence::{PersistenceConfig, RemoteDbConfig, ResultPersistence};
use edgescan_scanner::{
    CoreSupervisor, GeoResolver, JobHandle, ProbePipeline, RangePool, ScanRegistry, ScanScheduler,
    SourceRegistry, TaskStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Published CDN range lists are refreshed once a day
const RANGE_REFRESH_INTERVAL: Duration = Duration::from_secs(86_400);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    if !args.listen.ip().is_loopback() && !args.allow_remote {
        bail!(
            "refusing to bind {} without --allow-remote (the API has no authentication)",
            args.listen
        );
    }

    let dirs = AppDirs::init(args.app_dir.clone()).context("cannot initialize app directory")?;
    info!("app directory: {}", dirs.root().display());

    let supervisor = Arc::new(match &args.xray_path {
        Some(path) => CoreSupervisor::with_binary(path.clone(), dirs.root().to_path_buf()),
        None => CoreSupervisor::locate(dirs.root()),
    });
    info!("proxy core: {}", supervisor.binary().display());

    // Task store with startup recovery: crashed `running` scans come back
    // as paused, queryable but never auto-resumed
    let task_store = Arc::new(
        TaskStore::new(dirs.task_store_db())
            .await
            .context("cannot open task store")?,
    );
    let registry = Arc::new(ScanRegistry::new());
    for snapshot in task_store.recover().await.context("task store recovery failed")? {
        info!("rehydrated scan {} as {}", snapshot.id, snapshot.status);
        registry.insert(Arc::new(JobHandle::from_snapshot(snapshot)));
    }

    let persistence = Arc::new(
        ResultPersistence::from_config(
            PersistenceConfig {
                remote_db: args.db_host.as_ref().map(|host| RemoteDbConfig {
                    host: host.clone(),
                    port: args.db_port,
                    user: args.db_user.clone(),
                    password: args.db_password.clone(),
                    database: args.db_name.clone(),
                }),
                shim_url: args.shim_url.clone(),
                shim_api_key: args.shim_api_key.clone(),
                fronted_ips: Vec::new(),
                tunnel_proxy: args.tunnel_proxy.clone(),
                offline_db_path: dirs.offline_cache_db(),
            },
            supervisor.clone(),
        )
        .await
        .context("cannot initialize result persistence")?,
    );

    let geo = Arc::new(GeoResolver::new());
    let runner = Arc::new(ProbePipeline::new(supervisor.clone()));
    let scheduler = Arc::new(
        ScanScheduler::new(runner)
            .with_geo(geo.clone())
            .with_persistence(persistence.clone())
            .with_task_store(task_store.clone())
            .with_results_dir(dirs.results_dir()),
    );

    let pool = Arc::new(RangePool::cloudflare());
    let sources = Arc::new(SourceRegistry::new(pool.clone()));
    spawn_range_refresher(pool);

    let state = AppState::new(
        registry,
        scheduler,
        sources,
        Some(persistence.clone()),
        Some(task_store),
        geo,
        dirs.settings_file(),
    );

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("cannot bind {}", args.listen))?;
    info!("EdgeScan API listening on http://{}", args.listen);

    axum::serve(listener, edgescan_api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    persistence.shutdown().await;
    info!("shut down cleanly");
    Ok(())
}

/// Refresh the published Cloudflare ranges once a day; running scans keep
/// the snapshot they started with
fn spawn_range_refresher(pool: Arc<RangePool>) {
    tokio::spawn(async move {
        let client = reqwest_client();
        loop {
            if let Err(e) = pool.refresh(&client).await {
                warn!("range refresh failed: {}", e);
            }
            tokio::time::sleep(RANGE_REFRESH_INTERVAL).await;
        }
    });
}

fn reqwest_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .unwrap_or_default()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for shutdown signal: {}", e);
    }
}
