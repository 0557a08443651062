mod agents;
mod credentials;
mod jobs;
mod ledger;
mod schedules;
pub mod types;
mod workers;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::error::RuntimeResult;
use crate::core::lifecycle::LifecycleComponent;
use crate::platform::{NativePlatform, Platform};

pub use jobs::{ClaimBatch, ClaimRequest, Finalization, MAX_RETRIES_LIMIT, RateWindowCount};
pub use schedules::Promotion;

pub const DATABASE_FILE_NAME: &str = "hookwork.db";

/// Durable state shared by every worker, the poller and the API.
///
/// Cloning is cheap; all clones share one connection. Every status change is a
/// single conditional `UPDATE`, so correctness does not depend on the mutex
/// alone and holds for several processes sharing the database file.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Store {
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> RuntimeResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir)
                .await
                .map_err(anyhow::Error::from)?;
        }
        NativePlatform::restrict_dir_permissions(&data_dir);

        let db_path = data_dir.join(DATABASE_FILE_NAME);
        let db = Connection::open(&db_path)?;
        NativePlatform::restrict_file_permissions(&db_path);

        let _mode: String =
            db.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        db.busy_timeout(std::time::Duration::from_secs(5))?;
        init_schema(&db)?;

        info!("Job store opened at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            path: Some(db_path),
        })
    }

    pub fn open_in_memory() -> RuntimeResult<Self> {
        let db = Connection::open_in_memory()?;
        init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn init_schema(db: &Connection) -> rusqlite::Result<()> {
    db.execute(
        "CREATE TABLE IF NOT EXISTS agents (
            agent_id TEXT PRIMARY KEY,
            webhook_url TEXT NOT NULL,
            required_credentials TEXT NOT NULL DEFAULT '[]',
            timeout_secs INTEGER,
            active INTEGER NOT NULL DEFAULT 1,
            deactivated_reason TEXT,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS credentials (
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            encrypted_blob TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, provider)
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS jobs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL UNIQUE,
            agent_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            scheduled_at INTEGER NOT NULL,
            payload TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL,
            last_error TEXT,
            output TEXT,
            duration_ms INTEGER,
            worker_id TEXT,
            schedule_id TEXT,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            updated_at INTEGER NOT NULL,
            CHECK (retry_count >= 0 AND retry_count <= max_retries)
        )",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, scheduled_at, priority DESC, created_at)",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_agent_completed ON jobs(agent_id, completed_at)",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_user_created ON jobs(user_id, agent_id, created_at)",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS ledger (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            phase TEXT NOT NULL,
            recorded_at INTEGER NOT NULL,
            duration_ms INTEGER,
            data TEXT NOT NULL DEFAULT '{}'
        )",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_ledger_job ON ledger(job_id, id)",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS workers (
            worker_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            phase TEXT NOT NULL,
            active_jobs INTEGER NOT NULL DEFAULT 0,
            capacity INTEGER NOT NULL,
            capabilities TEXT,
            last_heartbeat INTEGER NOT NULL,
            started_at INTEGER NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS schedules (
            schedule_id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            cron_expression TEXT NOT NULL,
            timezone TEXT NOT NULL,
            payload TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            next_run INTEGER NOT NULL,
            last_run INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(active, next_run)",
        [],
    )?;

    Ok(())
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Read a TEXT column holding serialized JSON.
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn opt_json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(None),
    }
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

#[async_trait]
impl LifecycleComponent for Store {
    async fn on_start(&mut self) -> anyhow::Result<()> {
        let db = self.db.lock().await;
        let jobs: i64 = db.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status IN ('pending', 'running')",
            [],
            |row| row.get(0),
        )?;
        info!("Job store ready ({} open jobs)", jobs);
        Ok(())
    }
}

#[cfg(test)]
pub fn test_store() -> Store {
    Store::open_in_memory().expect("in-memory store")
}

#[cfg(test)]
pub fn test_agent(agent_id: &str, webhook_url: &str) -> types::AgentDescriptor {
    types::AgentDescriptor {
        agent_id: agent_id.to_string(),
        webhook_url: webhook_url.to_string(),
        required_credentials: Vec::new(),
        timeout_secs: None,
        active: true,
        deactivated_reason: None,
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
impl Store {
    /// Run a raw statement, for tests that need to damage rows.
    pub async fn execute_raw(&self, sql: &str) -> RuntimeResult<usize> {
        Ok(self.db.lock().await.execute(sql, [])?)
    }
}
