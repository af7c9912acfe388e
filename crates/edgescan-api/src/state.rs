//! Shared application state

use edgescan_scanner::{
    GeoResolver, ResultPersistence, ScanRegistry, ScanScheduler, SourceRegistry, TaskStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything the REST handlers need, initialized once at startup and
/// threaded through axum's `State`
pub struct AppState {
    pub registry: Arc<ScanRegistry>,
    pub scheduler: Arc<ScanScheduler>,
    pub sources: Arc<SourceRegistry>,
    pub persistence: Option<Arc<ResultPersistence>>,
    pub task_store: Option<Arc<TaskStore>>,
    pub geo: Arc<GeoResolver>,
    pub settings_path: PathBuf,
    /// Plain client for subscription fetches and the health probe
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(
        registry: Arc<ScanRegistry>,
        scheduler: Arc<ScanScheduler>,
        sources: Arc<SourceRegistry>,
        persistence: Option<Arc<ResultPersistence>>,
        task_store: Option<Arc<TaskStore>>,
        geo: Arc<GeoResolver>,
        settings_path: PathBuf,
    ) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            registry,
            scheduler,
            sources,
            persistence,
            task_store,
            geo,
            settings_path,
            client,
        })
    }
}
