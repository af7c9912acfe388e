//! Layered result persistence
//!
//! Result writes walk a fixed cascade and short-circuit on the first layer
//! that accepts the row:
//!
//! 1. direct remote MySQL (2 s write timeout)
//! 2. HTTPS REST shim carrying the same row as JSON
//! 3. the same shim reached by clean CDN IP with the shim's Host/SNI and
//!    certificate verification suppressed (domain fronting; that client is
//!    built here and never reused elsewhere)
//! 4. remote MySQL through a local dokodemo-door forward on 127.0.0.1:33060
//!    tunneled over the user's proxy
//! 5. local SQLite offline cache, rows marked `synced = 0` for later replay
//!
//! Reads (historical/community good IPs) mirror the cascade over the
//! read-capable layers (1 → 2 → 5). The layer that last accepted a write is
//! exposed as [`PersistMode`] for the health endpoint. Every failure here is
//! logged and swallowed; persistence never interrupts scanning.

use crate::supervisor::{CoreProcess, CoreSupervisor};
use crate::tunnel;
use async_trait::async_trait;
use edgescan_core::{Error, ProxyUri, Result, ResultRecord};
use parking_lot::Mutex;
use reqwest::Client;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Write timeout against the remote database
const DB_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Pool sizing for the direct and tunneled MySQL layers
const DB_POOL_MIN: u32 = 1;
const DB_POOL_MAX: u32 = 10;
const DB_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DB_IDLE_RECYCLE: Duration = Duration::from_secs(300);
/// Local inbound port of the dokodemo-door database forward
const DB_FORWARD_PORT: u16 = 33060;
/// REST shim request timeout
const SHIM_TIMEOUT: Duration = Duration::from_secs(5);

/// Cloudflare anycast addresses tried, in order, by the fronted layer
const DEFAULT_FRONT_IPS: &[&str] = &["104.16.132.229", "104.16.133.229"];

/// Which cascade layer last accepted a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    Direct,
    Proxy,
    Fronted,
    Tunnel,
    Offline,
}

impl fmt::Display for PersistMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PersistMode::Direct => "direct",
            PersistMode::Proxy => "proxy",
            PersistMode::Fronted => "fronted",
            PersistMode::Tunnel => "tunnel",
            PersistMode::Offline => "offline",
        };
        write!(f, "{}", s)
    }
}

/// Historical-good lookup parameters
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub isp: String,
    pub location: String,
    pub limit: u32,
}

/// Community-good lookup parameters
#[derive(Debug, Clone)]
pub struct CommunityQuery {
    pub country: String,
    pub isp: String,
    pub limit: u32,
}

/// Remote database endpoint
#[derive(Debug, Clone)]
pub struct RemoteDbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Cascade construction parameters; unset endpoints skip their layer
#[derive(Debug, Clone, Default)]
pub struct PersistenceConfig {
    pub remote_db: Option<RemoteDbConfig>,
    pub shim_url: Option<String>,
    pub shim_api_key: String,
    /// Clean CDN addresses for the fronted layer; defaults apply when empty
    pub fronted_ips: Vec<IpAddr>,
    /// Proxy URI for the tunneled database forward
    pub tunnel_proxy: Option<String>,
    pub offline_db_path: PathBuf,
}

/// One tier of the cascade
#[async_trait]
pub trait ResultLayer: Send + Sync {
    fn mode(&self) -> PersistMode;

    async fn save(&self, record: &ResultRecord) -> Result<()>;

    fn supports_reads(&self) -> bool {
        false
    }

    async fn historical_good(&self, _query: &HistoryQuery) -> Result<Vec<String>> {
        Err(Error::Storage("reads not supported on this layer".to_string()))
    }

    async fn community_good(&self, _query: &CommunityQuery) -> Result<Vec<String>> {
        Err(Error::Storage("reads not supported on this layer".to_string()))
    }

    /// Release long-lived resources (tunnel layer)
    async fn close(&self) {}
}

/// The ordered cascade
pub struct ResultPersistence {
    layers: Vec<Arc<dyn ResultLayer>>,
    active: Mutex<PersistMode>,
}

impl ResultPersistence {
    /// Build the full cascade from configuration
    ///
    /// The offline cache is always present and always last; remote layers
    /// appear only when configured.
    pub async fn from_config(
        config: PersistenceConfig,
        supervisor: Arc<CoreSupervisor>,
    ) -> Result<Self> {
        let mut layers: Vec<Arc<dyn ResultLayer>> = Vec::new();

        if let Some(db) = &config.remote_db {
            let direct = DirectDbLayer::new(db.clone());
            direct.ensure_schema().await;
            layers.push(Arc::new(direct));
        }

        if let Some(shim_url) = &config.shim_url {
            layers.push(Arc::new(HttpShimLayer::new(
                shim_url.clone(),
                config.shim_api_key.clone(),
            )?));

            let fronted_ips: Vec<IpAddr> = if config.fronted_ips.is_empty() {
                DEFAULT_FRONT_IPS.iter().filter_map(|s| s.parse().ok()).collect()
            } else {
                config.fronted_ips.clone()
            };
            layers.push(Arc::new(FrontedShimLayer::new(
                shim_url.clone(),
                config.shim_api_key.clone(),
                fronted_ips,
            )?));
        }

        if let (Some(db), Some(proxy_uri)) = (&config.remote_db, &config.tunnel_proxy) {
            layers.push(Arc::new(TunnelDbLayer::new(
                db.clone(),
                ProxyUri::parse(proxy_uri),
                supervisor,
            )));
        }

        layers.push(Arc::new(LocalCacheLayer::open(&config.offline_db_path).await?));

        info!("result persistence ready with {} layer(s)", layers.len());
        Ok(Self::from_layers(layers))
    }

    /// Assemble a cascade from explicit layers (tests, custom setups)
    pub fn from_layers(layers: Vec<Arc<dyn ResultLayer>>) -> Self {
        let initial = layers
            .first()
            .map(|l| l.mode())
            .unwrap_or(PersistMode::Offline);
        Self {
            layers,
            active: Mutex::new(initial),
        }
    }

    /// Layer that last accepted a write
    pub fn mode(&self) -> PersistMode {
        *self.active.lock()
    }

    /// Write a result row through the cascade; never fails
    pub async fn save_scan_result(&self, record: &ResultRecord) {
        for layer in &self.layers {
            match layer.save(record).await {
                Ok(()) => {
                    *self.active.lock() = layer.mode();
                    return;
                }
                Err(e) => debug!("persistence layer {} rejected write: {}", layer.mode(), e),
            }
        }
        warn!("all persistence layers rejected a result write");
    }

    /// Historical good IPs, first read-capable layer that answers
    pub async fn historical_good(&self, query: &HistoryQuery) -> Vec<String> {
        for layer in self.layers.iter().filter(|l| l.supports_reads()) {
            match layer.historical_good(query).await {
                Ok(ips) if !ips.is_empty() => return ips,
                Ok(_) => continue,
                Err(e) => debug!("history read via {} failed: {}", layer.mode(), e),
            }
        }
        Vec::new()
    }

    /// Community good IPs, first read-capable layer that answers
    pub async fn community_good(&self, query: &CommunityQuery) -> Vec<String> {
        for layer in self.layers.iter().filter(|l| l.supports_reads()) {
            match layer.community_good(query).await {
                Ok(ips) if !ips.is_empty() => return ips,
                Ok(_) => continue,
                Err(e) => debug!("community read via {} failed: {}", layer.mode(), e),
            }
        }
        Vec::new()
    }

    /// Tear down long-lived layer resources
    pub async fn shutdown(&self) {
        for layer in &self.layers {
            layer.close().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Layer 1: direct remote MySQL

struct DirectDbLayer {
    pool: MySqlPool,
}

impl DirectDbLayer {
    fn new(config: RemoteDbConfig) -> Self {
        Self {
            pool: mysql_pool(&config.host, config.port, &config),
        }
    }

    /// Best-effort schema creation; offline startup is normal
    async fn ensure_schema(&self) {
        let result = tokio::time::timeout(
            DB_CONNECT_TIMEOUT,
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS scan_results (
                    id INT AUTO_INCREMENT PRIMARY KEY,
                    timestamp DATETIME,
                    user_ip VARCHAR(50),
                    user_location VARCHAR(255),
                    user_isp VARCHAR(255),
                    credential_id VARCHAR(100),
                    scanned_ip VARCHAR(50),
                    source_tag VARCHAR(50),
                    ping FLOAT,
                    jitter FLOAT,
                    download FLOAT,
                    upload FLOAT,
                    status VARCHAR(50),
                    datacenter VARCHAR(50),
                    asn VARCHAR(50),
                    net_type VARCHAR(50),
                    port INT,
                    sni VARCHAR(255),
                    provider VARCHAR(50),
                    app_version VARCHAR(50)
                )
                "#,
            )
            .execute(&self.pool),
        )
        .await;
        match result {
            Ok(Ok(_)) => debug!("remote scan_results table verified"),
            Ok(Err(e)) => debug!("remote schema init failed: {}", e),
            Err(_) => debug!("remote schema init timed out"),
        }
    }
}

#[async_trait]
impl ResultLayer for DirectDbLayer {
    fn mode(&self) -> PersistMode {
        PersistMode::Direct
    }

    async fn save(&self, record: &ResultRecord) -> Result<()> {
        mysql_insert(&self.pool, record).await
    }

    fn supports_reads(&self) -> bool {
        true
    }

    async fn historical_good(&self, query: &HistoryQuery) -> Result<Vec<String>> {
        mysql_historical(&self.pool, query).await
    }

    async fn community_good(&self, query: &CommunityQuery) -> Result<Vec<String>> {
        mysql_community(&self.pool, query).await
    }
}

// ---------------------------------------------------------------------------
// Layer 2: HTTPS REST shim

struct HttpShimLayer {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpShimLayer {
    fn new(base_url: String, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(SHIM_TIMEOUT)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ResultLayer for HttpShimLayer {
    fn mode(&self) -> PersistMode {
        PersistMode::Proxy
    }

    async fn save(&self, record: &ResultRecord) -> Result<()> {
        shim_save(&self.client, &self.base_url, &self.api_key, record).await
    }

    fn supports_reads(&self) -> bool {
        true
    }

    async fn historical_good(&self, query: &HistoryQuery) -> Result<Vec<String>> {
        let url = format!(
            "{}/good-ips?isp={}&location={}&limit={}",
            self.base_url, query.isp, query.location, query.limit
        );
        shim_fetch_ips(&self.client, &url, &self.api_key).await
    }

    async fn community_good(&self, query: &CommunityQuery) -> Result<Vec<String>> {
        let url = format!(
            "{}/community-ips?country={}&isp={}&limit={}",
            self.base_url, query.country, query.isp, query.limit
        );
        shim_fetch_ips(&self.client, &url, &self.api_key).await
    }
}

// ---------------------------------------------------------------------------
// Layer 3: REST shim over a clean fronting IP
//
// The no-verify clients are private to this layer; nothing else may reuse
// them.

struct FrontedShimLayer {
    clients: Vec<Client>,
    base_url: String,
    api_key: String,
}

impl FrontedShimLayer {
    fn new(base_url: String, api_key: String, front_ips: Vec<IpAddr>) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let host = host_of(&base_url)
            .ok_or_else(|| Error::Config(format!("shim URL has no host: {}", base_url)))?;

        let mut clients = Vec::new();
        for ip in front_ips {
            let client = Client::builder()
                .timeout(SHIM_TIMEOUT)
                .resolve(&host, std::net::SocketAddr::new(ip, 443))
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| Error::Network(e.to_string()))?;
            clients.push(client);
        }
        Ok(Self {
            clients,
            base_url,
            api_key,
        })
    }
}

#[async_trait]
impl ResultLayer for FrontedShimLayer {
    fn mode(&self) -> PersistMode {
        PersistMode::Fronted
    }

    async fn save(&self, record: &ResultRecord) -> Result<()> {
        let mut last_err = Error::Network("no fronting IPs configured".to_string());
        for client in &self.clients {
            match shim_save(client, &self.base_url, &self.api_key, record).await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

// ---------------------------------------------------------------------------
// Layer 4: MySQL through a dokodemo-door forward over the user's proxy

struct TunnelState {
    core: Option<CoreProcess>,
    pool: MySqlPool,
}

struct TunnelDbLayer {
    db: RemoteDbConfig,
    proxy: ProxyUri,
    supervisor: Arc<CoreSupervisor>,
    state: tokio::sync::Mutex<Option<TunnelState>>,
}

impl TunnelDbLayer {
    fn new(db: RemoteDbConfig, proxy: ProxyUri, supervisor: Arc<CoreSupervisor>) -> Self {
        Self {
            db,
            proxy,
            supervisor,
            state: tokio::sync::Mutex::new(None),
        }
    }

    async fn pool(&self) -> Result<MySqlPool> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            let config =
                tunnel::forward_config(&self.proxy, DB_FORWARD_PORT, &self.db.host, self.db.port);
            let core = self.supervisor.launch(&config, "db_forward").await?;
            // Give the forward a moment to bind before the pool dials it
            tokio::time::sleep(Duration::from_secs(1)).await;
            let pool = mysql_pool("127.0.0.1", DB_FORWARD_PORT, &self.db);
            *state = Some(TunnelState {
                core: Some(core),
                pool,
            });
            info!("database tunnel forward started on 127.0.0.1:{}", DB_FORWARD_PORT);
        }
        match state.as_ref() {
            Some(inner) => Ok(inner.pool.clone()),
            None => Err(Error::Storage("tunnel forward unavailable".to_string())),
        }
    }
}

#[async_trait]
impl ResultLayer for TunnelDbLayer {
    fn mode(&self) -> PersistMode {
        PersistMode::Tunnel
    }

    async fn save(&self, record: &ResultRecord) -> Result<()> {
        let pool = self.pool().await?;
        mysql_insert(&pool, record).await
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut inner) = state.take() {
            if let Some(core) = inner.core.take() {
                core.shutdown().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Layer 5: local SQLite offline cache

const LOCAL_MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE scan_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        user_ip TEXT,
        user_location TEXT,
        user_isp TEXT,
        credential_id TEXT,
        scanned_ip TEXT,
        source_tag TEXT,
        ping REAL,
        jitter REAL,
        download REAL,
        upload REAL,
        status TEXT,
        datacenter TEXT,
        asn TEXT,
        net_type TEXT,
        port INTEGER,
        sni TEXT,
        provider TEXT,
        app_version TEXT,
        synced INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX idx_results_status ON scan_results(status);
"#];

/// Always-available local fallback (`offline_cache.db`)
pub struct LocalCacheLayer {
    pool: SqlitePool,
}

impl LocalCacheLayer {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path_str))
            .map_err(|e| Error::Storage(format!("invalid cache path: {}", e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| Error::Storage(format!("failed to open offline cache: {}", e)))?;

        let layer = Self { pool };
        layer.migrate().await?;
        Ok(layer)
    }

    async fn migrate(&self) -> Result<()> {
        let row = sqlx::query("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("cannot read cache version: {}", e)))?;
        let version: i64 = row.get(0);

        for (index, migration) in LOCAL_MIGRATIONS.iter().enumerate().skip(version as usize) {
            // Migrations may hold several statements
            for statement in migration.split(';').filter(|s| !s.trim().is_empty()) {
                sqlx::query(statement)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| Error::Storage(format!("cache migration {} failed: {}", index + 1, e)))?;
            }
        }
        sqlx::query(&format!("PRAGMA user_version = {}", LOCAL_MIGRATIONS.len()))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("cannot set cache version: {}", e)))?;
        Ok(())
    }

    /// Number of rows not yet replayed to a remote layer
    pub async fn unsynced_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM scan_results WHERE synced = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(row.get::<i64, _>(0) as u64)
    }
}

#[async_trait]
impl ResultLayer for LocalCacheLayer {
    fn mode(&self) -> PersistMode {
        PersistMode::Offline
    }

    async fn save(&self, record: &ResultRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_results
                (timestamp, user_ip, user_location, user_isp, credential_id, scanned_ip,
                 source_tag, ping, jitter, download, upload, status, datacenter, asn,
                 net_type, port, sni, provider, app_version, synced)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(record.timestamp.to_rfc3339())
        .bind(&record.user_ip)
        .bind(&record.user_location)
        .bind(&record.user_isp)
        .bind(&record.credential_id)
        .bind(&record.scanned_ip)
        .bind(&record.source_tag)
        .bind(record.ping)
        .bind(record.jitter)
        .bind(record.download)
        .bind(record.upload)
        .bind(&record.status)
        .bind(&record.datacenter)
        .bind(&record.asn)
        .bind(&record.net_type)
        .bind(record.port)
        .bind(&record.sni)
        .bind(&record.provider)
        .bind(&record.app_version)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("offline cache write failed: {}", e)))?;
        Ok(())
    }

    fn supports_reads(&self) -> bool {
        true
    }

    async fn historical_good(&self, query: &HistoryQuery) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT scanned_ip FROM scan_results
            WHERE status = 'ok' AND ping < 300 AND download > 5
              AND user_isp = ? AND user_location = ?
            ORDER BY timestamp DESC LIMIT ?
            "#,
        )
        .bind(&query.isp)
        .bind(&query.location)
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        let mut ips: Vec<String> = rows.iter().map(|r| r.get("scanned_ip")).collect();

        if ips.len() < (query.limit / 2) as usize {
            let wider = sqlx::query(
                r#"
                SELECT DISTINCT scanned_ip FROM scan_results
                WHERE status = 'ok' AND ping < 300 AND download > 5 AND user_isp = ?
                ORDER BY timestamp DESC LIMIT ?
                "#,
            )
            .bind(&query.isp)
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
            ips.extend(wider.iter().map(|r| r.get::<String, _>("scanned_ip")));
        }

        if ips.is_empty() {
            let global = sqlx::query(
                "SELECT DISTINCT scanned_ip FROM scan_results WHERE status = 'ok' ORDER BY timestamp DESC LIMIT ?",
            )
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
            ips.extend(global.iter().map(|r| r.get::<String, _>("scanned_ip")));
        }

        Ok(dedup_preserving_order(ips))
    }

    async fn community_good(&self, query: &CommunityQuery) -> Result<Vec<String>> {
        let like_country = if query.country.is_empty() {
            "%".to_string()
        } else {
            format!("{}%", query.country)
        };
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT scanned_ip FROM scan_results
            WHERE status = 'ok'
              AND (user_location LIKE ? OR user_isp = ?)
              AND timestamp > datetime('now', '-7 day')
            ORDER BY download DESC, ping ASC LIMIT ?
            "#,
        )
        .bind(&like_country)
        .bind(&query.isp)
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        let mut ips: Vec<String> = rows.iter().map(|r| r.get("scanned_ip")).collect();

        if ips.len() < (query.limit / 2) as usize {
            let global = sqlx::query(
                r#"
                SELECT DISTINCT scanned_ip FROM scan_results
                WHERE status = 'ok' AND timestamp > datetime('now', '-2 day')
                ORDER BY download DESC LIMIT ?
                "#,
            )
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
            ips.extend(global.iter().map(|r| r.get::<String, _>("scanned_ip")));
        }

        Ok(dedup_preserving_order(ips))
    }
}

// ---------------------------------------------------------------------------
// Shared helpers

fn mysql_pool(host: &str, port: u16, config: &RemoteDbConfig) -> MySqlPool {
    let options = MySqlConnectOptions::new()
        .host(host)
        .port(port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.database);
    MySqlPoolOptions::new()
        .min_connections(DB_POOL_MIN)
        .max_connections(DB_POOL_MAX)
        .acquire_timeout(DB_CONNECT_TIMEOUT)
        .idle_timeout(DB_IDLE_RECYCLE)
        .connect_lazy_with(options)
}

async fn mysql_insert(pool: &MySqlPool, record: &ResultRecord) -> Result<()> {
    let insert = sqlx::query(
        r#"
        INSERT INTO scan_results
            (timestamp, user_ip, user_location, user_isp, credential_id, scanned_ip,
             source_tag, ping, jitter, download, upload, status, datacenter, asn,
             net_type, port, sni, provider, app_version)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.timestamp.naive_utc())
    .bind(&record.user_ip)
    .bind(&record.user_location)
    .bind(&record.user_isp)
    .bind(&record.credential_id)
    .bind(&record.scanned_ip)
    .bind(&record.source_tag)
    .bind(record.ping)
    .bind(record.jitter)
    .bind(record.download)
    .bind(record.upload)
    .bind(&record.status)
    .bind(&record.datacenter)
    .bind(&record.asn)
    .bind(&record.net_type)
    .bind(record.port)
    .bind(&record.sni)
    .bind(&record.provider)
    .bind(&record.app_version)
    .execute(pool);

    tokio::time::timeout(DB_WRITE_TIMEOUT, insert)
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Storage(format!("remote write failed: {}", e)))?;
    Ok(())
}

async fn mysql_historical(pool: &MySqlPool, query: &HistoryQuery) -> Result<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT scanned_ip FROM scan_results
        WHERE status = 'ok' AND ping < 300 AND download > 5
          AND user_isp = ? AND user_location = ?
        ORDER BY timestamp DESC LIMIT ?
        "#,
    )
    .bind(&query.isp)
    .bind(&query.location)
    .bind(query.limit)
    .fetch_all(pool)
    .await
    .map_err(|e| Error::Storage(e.to_string()))?;

    let mut ips: Vec<String> = rows.iter().map(|r| r.get("scanned_ip")).collect();

    if ips.len() < (query.limit / 2) as usize {
        let wider = sqlx::query(
            r#"
            SELECT DISTINCT scanned_ip FROM scan_results
            WHERE status = 'ok' AND ping < 300 AND download > 5 AND user_isp = ?
            ORDER BY timestamp DESC LIMIT ?
            "#,
        )
        .bind(&query.isp)
        .bind(query.limit)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        ips.extend(wider.iter().map(|r| r.get::<String, _>("scanned_ip")));
    }

    if ips.is_empty() {
        let global = sqlx::query(
            "SELECT DISTINCT scanned_ip FROM scan_results WHERE status = 'ok' ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(query.limit)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        ips.extend(global.iter().map(|r| r.get::<String, _>("scanned_ip")));
    }

    Ok(dedup_preserving_order(ips))
}

async fn mysql_community(pool: &MySqlPool, query: &CommunityQuery) -> Result<Vec<String>> {
    let like_country = if query.country.is_empty() {
        "%".to_string()
    } else {
        format!("{}%", query.country)
    };
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT scanned_ip FROM scan_results
        WHERE status = 'ok'
          AND (user_location LIKE ? OR user_isp = ?)
          AND timestamp > DATE_SUB(NOW(), INTERVAL 7 DAY)
        ORDER BY download DESC, ping ASC LIMIT ?
        "#,
    )
    .bind(&like_country)
    .bind(&query.isp)
    .bind(query.limit)
    .fetch_all(pool)
    .await
    .map_err(|e| Error::Storage(e.to_string()))?;

    let mut ips: Vec<String> = rows.iter().map(|r| r.get("scanned_ip")).collect();

    if ips.len() < (query.limit / 2) as usize {
        let global = sqlx::query(
            r#"
            SELECT DISTINCT scanned_ip FROM scan_results
            WHERE status = 'ok' AND timestamp > DATE_SUB(NOW(), INTERVAL 2 DAY)
            ORDER BY download DESC LIMIT ?
            "#,
        )
        .bind(query.limit)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        ips.extend(global.iter().map(|r| r.get::<String, _>("scanned_ip")));
    }

    Ok(dedup_preserving_order(ips))
}

async fn shim_save(
    client: &Client,
    base_url: &str,
    api_key: &str,
    record: &ResultRecord,
) -> Result<()> {
    let resp = client
        .post(format!("{}/scan-results", base_url))
        .header("x-api-key", api_key)
        .json(record)
        .send()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(Error::Network(format!("shim returned {}", resp.status())))
    }
}

async fn shim_fetch_ips(client: &Client, url: &str, api_key: &str) -> Result<Vec<String>> {
    #[derive(serde::Deserialize)]
    struct IpList {
        #[serde(default)]
        ips: Vec<String>,
    }

    let resp = client
        .get(url)
        .header("x-api-key", api_key)
        .send()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(Error::Network(format!("shim returned {}", resp.status())));
    }
    let list: IpList = resp.json().await.map_err(|e| Error::Network(e.to_string()))?;
    Ok(list.ips)
}

fn dedup_preserving_order(ips: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ips.into_iter().filter(|ip| seen.insert(ip.clone())).collect()
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1)?;
    let host_port = rest.split('/').next()?;
    let host = host_port.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_record(ip: &str) -> ResultRecord {
        ResultRecord {
            timestamp: Utc::now(),
            user_ip: "5.6.7.8".to_string(),
            user_location: "Germany - Berlin".to_string(),
            user_isp: "ISP X".to_string(),
            credential_id: "uuid-1".to_string(),
            scanned_ip: ip.to_string(),
            source_tag: "official".to_string(),
            ping: 50.0,
            jitter: 5.0,
            download: 10.0,
            upload: 2.0,
            status: "ok".to_string(),
            datacenter: "FRA".to_string(),
            asn: "AS13335".to_string(),
            net_type: "ws".to_string(),
            port: 443,
            sni: "cdn.example.com".to_string(),
            provider: "cloudflare".to_string(),
            app_version: "0.3.1".to_string(),
        }
    }

    struct FailingLayer {
        mode: PersistMode,
    }

    #[async_trait]
    impl ResultLayer for FailingLayer {
        fn mode(&self) -> PersistMode {
            self.mode
        }
        async fn save(&self, _record: &ResultRecord) -> Result<()> {
            Err(Error::Network("offline".to_string()))
        }
    }

    struct RecordingLayer {
        mode: PersistMode,
        saved: Mutex<Vec<String>>,
    }

    impl RecordingLayer {
        fn new(mode: PersistMode) -> Self {
            Self {
                mode,
                saved: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ResultLayer for RecordingLayer {
        fn mode(&self) -> PersistMode {
            self.mode
        }
        async fn save(&self, record: &ResultRecord) -> Result<()> {
            self.saved.lock().push(record.scanned_ip.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cascade_short_circuits_on_first_success() {
        let first = Arc::new(RecordingLayer::new(PersistMode::Direct));
        let second = Arc::new(RecordingLayer::new(PersistMode::Proxy));
        let persistence =
            ResultPersistence::from_layers(vec![first.clone(), second.clone()]);

        persistence.save_scan_result(&sample_record("1.1.1.1")).await;

        assert_eq!(first.saved.lock().len(), 1);
        assert_eq!(second.saved.lock().len(), 0);
        assert_eq!(persistence.mode(), PersistMode::Direct);
    }

    #[tokio::test]
    async fn test_cascade_falls_through_to_next_layer() {
        let first = Arc::new(FailingLayer {
            mode: PersistMode::Direct,
        });
        let second = Arc::new(RecordingLayer::new(PersistMode::Proxy));
        let persistence =
            ResultPersistence::from_layers(vec![first, second.clone()]);

        persistence.save_scan_result(&sample_record("1.1.1.1")).await;

        assert_eq!(second.saved.lock().len(), 1);
        assert_eq!(persistence.mode(), PersistMode::Proxy);
    }

    #[tokio::test]
    async fn test_all_remote_layers_down_lands_in_offline_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            LocalCacheLayer::open(dir.path().join("offline_cache.db"))
                .await
                .unwrap(),
        );
        let layers: Vec<Arc<dyn ResultLayer>> = vec![
            Arc::new(FailingLayer { mode: PersistMode::Direct }),
            Arc::new(FailingLayer { mode: PersistMode::Proxy }),
            Arc::new(FailingLayer { mode: PersistMode::Fronted }),
            Arc::new(FailingLayer { mode: PersistMode::Tunnel }),
            cache.clone(),
        ];
        let persistence = ResultPersistence::from_layers(layers);

        persistence.save_scan_result(&sample_record("104.16.1.1")).await;
        persistence.save_scan_result(&sample_record("104.16.1.2")).await;

        assert_eq!(persistence.mode(), PersistMode::Offline);
        assert_eq!(cache.unsynced_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_local_cache_history_reads() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCacheLayer::open(dir.path().join("offline_cache.db"))
            .await
            .unwrap();

        cache.save(&sample_record("104.16.1.1")).await.unwrap();
        cache.save(&sample_record("104.16.1.2")).await.unwrap();
        let mut slow = sample_record("104.16.9.9");
        slow.ping = 900.0; // filtered by the quality gate
        cache.save(&slow).await.unwrap();

        let ips = cache
            .historical_good(&HistoryQuery {
                isp: "ISP X".to_string(),
                location: "Germany - Berlin".to_string(),
                limit: 10,
            })
            .await
            .unwrap();

        assert!(ips.contains(&"104.16.1.1".to_string()));
        assert!(ips.contains(&"104.16.1.2".to_string()));
        assert!(!ips.contains(&"104.16.9.9".to_string()));
    }

    #[tokio::test]
    async fn test_local_cache_history_widens_to_global() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCacheLayer::open(dir.path().join("offline_cache.db"))
            .await
            .unwrap();
        cache.save(&sample_record("104.16.1.1")).await.unwrap();

        // No rows for this ISP/location, but the global fallback answers
        let ips = cache
            .historical_good(&HistoryQuery {
                isp: "Other ISP".to_string(),
                location: "Elsewhere".to_string(),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(ips, vec!["104.16.1.1".to_string()]);
    }

    #[tokio::test]
    async fn test_community_reads_prefer_region() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCacheLayer::open(dir.path().join("offline_cache.db"))
            .await
            .unwrap();
        cache.save(&sample_record("104.16.1.1")).await.unwrap();

        let ips = cache
            .community_good(&CommunityQuery {
                country: "Germany".to_string(),
                isp: "ISP X".to_string(),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(ips, vec!["104.16.1.1".to_string()]);
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://shim.example.org/api"), Some("shim.example.org".to_string()));
        assert_eq!(host_of("https://shim.example.org:8443"), Some("shim.example.org".to_string()));
        assert_eq!(host_of("nonsense"), None);
    }

    #[test]
    fn test_dedup_preserves_order() {
        let ips = vec![
            "1.1.1.1".to_string(),
            "2.2.2.2".to_string(),
            "1.1.1.1".to_string(),
        ];
        assert_eq!(dedup_preserving_order(ips), vec!["1.1.1.1", "2.2.2.2"]);
    }
}
