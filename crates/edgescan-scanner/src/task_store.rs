//! Persistent task store
//!
//! One SQLite row per scan job, written through by a background flusher
//! every two seconds and once more at the terminal state. On startup any
//! row still marked `running` is rewritten to `paused` — a crashed run is
//! never silently resumed as running — and non-terminal jobs are rehydrated
//! so external queries keep returning the last observed state. Interrupted
//! jobs are not relaunched automatically; restarting is a user action.
//!
//! The schema is versioned through `PRAGMA user_version` and migrated
//! deterministically at open.

use chrono::{DateTime, Utc};
use edgescan_core::{Error, JobSnapshot, Result, ScanParams, ScanStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Ordered schema migrations; `user_version` records how many have run
const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE scan_jobs (
        scan_id TEXT PRIMARY KEY,
        status TEXT NOT NULL DEFAULT 'queued',
        payload TEXT NOT NULL DEFAULT '{}',
        total INTEGER NOT NULL DEFAULT 0,
        completed INTEGER NOT NULL DEFAULT 0,
        found_good INTEGER NOT NULL DEFAULT 0,
        logs TEXT NOT NULL DEFAULT '[]',
        stats TEXT NOT NULL DEFAULT '{}',
        results TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL
    )
"#];

/// Durable record of scan jobs (`scan_queue.db`)
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Open (or create) the store at `path`; `":memory:"` works for tests
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path_str))
            .map_err(|e| Error::Storage(format!("invalid database path: {}", e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| Error::Storage(format!("failed to open task store: {}", e)))?;

        let store = Self { pool };
        store.migrate().await?;
        info!("task store ready at {}", path_str);
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        let row = sqlx::query("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("cannot read schema version: {}", e)))?;
        let version: i64 = row.get(0);

        for (index, migration) in MIGRATIONS.iter().enumerate().skip(version as usize) {
            debug!("applying task store migration {}", index + 1);
            sqlx::query(migration)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Storage(format!("migration {} failed: {}", index + 1, e)))?;
        }

        sqlx::query(&format!("PRAGMA user_version = {}", MIGRATIONS.len()))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("cannot set schema version: {}", e)))?;
        Ok(())
    }

    /// Insert the initial row for a new scan
    pub async fn create_job(&self, snapshot: &JobSnapshot, payload: &ScanParams) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_jobs
                (scan_id, status, payload, total, completed, found_good, logs, stats, results, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.id.to_string())
        .bind(snapshot.status.to_string())
        .bind(serde_json::to_string(payload)?)
        .bind(snapshot.total as i64)
        .bind(snapshot.completed as i64)
        .bind(snapshot.found_good as i64)
        .bind(serde_json::to_string(&snapshot.logs)?)
        .bind(serde_json::to_string(&snapshot.stats)?)
        .bind(serde_json::to_string(&snapshot.results)?)
        .bind(snapshot.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("failed to create job row: {}", e)))?;
        Ok(())
    }

    /// Write the current in-memory state through to the row
    pub async fn update_job(&self, snapshot: &JobSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = ?, total = ?, completed = ?, found_good = ?,
                logs = ?, stats = ?, results = ?
            WHERE scan_id = ?
            "#,
        )
        .bind(snapshot.status.to_string())
        .bind(snapshot.total as i64)
        .bind(snapshot.completed as i64)
        .bind(snapshot.found_good as i64)
        .bind(serde_json::to_string(&snapshot.logs)?)
        .bind(serde_json::to_string(&snapshot.stats)?)
        .bind(serde_json::to_string(&snapshot.results)?)
        .bind(snapshot.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("failed to update job row: {}", e)))?;
        Ok(())
    }

    pub async fn get_job(&self, id: &Uuid) -> Result<Option<JobSnapshot>> {
        let row = sqlx::query("SELECT * FROM scan_jobs WHERE scan_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("failed to read job row: {}", e)))?;
        row.map(row_to_snapshot).transpose()
    }

    /// Startup recovery: rewrite crashed `running` rows to `paused`, then
    /// return every non-terminal job for rehydration
    pub async fn recover(&self) -> Result<Vec<JobSnapshot>> {
        let rewritten = sqlx::query("UPDATE scan_jobs SET status = 'paused' WHERE status = 'running'")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("recovery rewrite failed: {}", e)))?;
        if rewritten.rows_affected() > 0 {
            info!(
                "recovered {} interrupted scan(s) as paused",
                rewritten.rows_affected()
            );
        }

        let rows = sqlx::query("SELECT * FROM scan_jobs WHERE status IN ('queued', 'paused')")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("recovery load failed: {}", e)))?;

        rows.into_iter().map(row_to_snapshot).collect()
    }
}

fn row_to_snapshot(row: SqliteRow) -> Result<JobSnapshot> {
    let id: String = row.get("scan_id");
    let status: String = row.get("status");
    let logs: String = row.get("logs");
    let stats: String = row.get("stats");
    let results: String = row.get("results");
    let created_at: String = row.get("created_at");

    Ok(JobSnapshot {
        id: Uuid::parse_str(&id).map_err(|e| Error::Parse(format!("bad scan id: {}", e)))?,
        status: status.parse::<ScanStatus>()?,
        total: row.get::<i64, _>("total") as u64,
        completed: row.get::<i64, _>("completed") as u64,
        found_good: row.get::<i64, _>("found_good") as u64,
        logs: serde_json::from_str(&logs)?,
        stats: serde_json::from_str(&stats)?,
        results: serde_json::from_str(&results)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JobHandle;
    use edgescan_core::{OutcomeStatus, ProbeOutcome};

    fn sample_params() -> ScanParams {
        serde_json::from_str(r#"{"vless_config": "vless://u@h:443?type=ws"}"#).unwrap()
    }

    #[tokio::test]
    async fn test_create_update_get_round_trip() {
        let store = TaskStore::new(":memory:").await.unwrap();
        let job = JobHandle::new(Uuid::new_v4(), 10);
        store.create_job(&job.snapshot(), &sample_params()).await.unwrap();

        job.set_status(ScanStatus::Running);
        job.add_log("Checking 1.1.1.1...");
        job.record_outcome(ProbeOutcome::new("1.1.1.1", 443, OutcomeStatus::Ok));
        job.incr_found_good();
        store.update_job(&job.snapshot()).await.unwrap();

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ScanStatus::Running);
        assert_eq!(loaded.completed, 1);
        assert_eq!(loaded.found_good, 1);
        assert_eq!(loaded.results.len(), 1);
        assert_eq!(loaded.results[0].status, OutcomeStatus::Ok);
        assert_eq!(loaded.logs.len(), 1);
    }

    #[tokio::test]
    async fn test_get_unknown_job() {
        let store = TaskStore::new(":memory:").await.unwrap();
        assert!(store.get_job(&Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recovery_rewrites_running_to_paused() {
        let store = TaskStore::new(":memory:").await.unwrap();

        let running = JobHandle::new(Uuid::new_v4(), 10);
        running.set_status(ScanStatus::Running);
        store.create_job(&running.snapshot(), &sample_params()).await.unwrap();

        let done = JobHandle::new(Uuid::new_v4(), 10);
        done.set_status(ScanStatus::Running);
        done.set_status(ScanStatus::Completed);
        store.create_job(&done.snapshot(), &sample_params()).await.unwrap();

        let recovered = store.recover().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, running.id);
        assert_eq!(recovered[0].status, ScanStatus::Paused);

        // Completed rows are untouched and not rehydrated
        let done_row = store.get_job(&done.id).await.unwrap().unwrap();
        assert_eq!(done_row.status, ScanStatus::Completed);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan_queue.db");
        {
            let store = TaskStore::new(&path).await.unwrap();
            let job = JobHandle::new(Uuid::new_v4(), 1);
            store.create_job(&job.snapshot(), &sample_params()).await.unwrap();
        }
        // Reopening must not re-run the initial migration
        let store = TaskStore::new(&path).await.unwrap();
        assert!(store.recover().await.unwrap().len() <= 1);
    }
}
