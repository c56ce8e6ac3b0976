//! `rusqlite`-backed `ObjectStore`.
//!
//! Grounded on the teacher's `signals::db_storage::DbSignalStorage`: WAL
//! mode, an `Arc<Mutex<Connection>>` guarding a single shared connection
//! (rusqlite connections aren't `Sync`), upsert via
//! `ON CONFLICT DO UPDATE`, and covering indexes for the query shapes the
//! rest of the system actually uses.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{info, warn};

use super::ObjectStore;
use crate::error::StoreError;
use crate::models::{AsyncBacktestTask, BacktestRow, SymbolFilterCacheEntry, TaskStatus};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS backtest_rows (
    timestamp INTEGER PRIMARY KEY,
    hour INTEGER NOT NULL,
    document TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backtest_rows_created_at ON backtest_rows(created_at);

CREATE TABLE IF NOT EXISTS filter_cache_entries (
    filter_hash TEXT PRIMARY KEY,
    document TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_used_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_filter_cache_created_at ON filter_cache_entries(created_at);
CREATE INDEX IF NOT EXISTS idx_filter_cache_last_used_at ON filter_cache_entries(last_used_at);

CREATE TABLE IF NOT EXISTS async_backtest_tasks (
    task_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    document TEXT NOT NULL,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_async_tasks_status ON async_backtest_tasks(status);
CREATE INDEX IF NOT EXISTS idx_async_tasks_created_at ON async_backtest_tasks(created_at);
"#;

pub struct SqliteObjectStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteObjectStore {
    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .map_err(|e| anyhow::anyhow!("failed to open database at {db_path}: {e}"))?;
        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!(journal_mode, "WAL mode not active");
        }

        info!(db_path, "object store initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl ObjectStore for SqliteObjectStore {
    async fn upsert_backtest_row(&self, row: &BacktestRow) -> Result<(), StoreError> {
        let document = serde_json::to_string(row)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO backtest_rows (timestamp, hour, document, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(timestamp) DO UPDATE SET
                hour = excluded.hour,
                document = excluded.document,
                created_at = excluded.created_at",
            params![
                to_ts(row.timestamp),
                row.hour,
                document,
                to_ts(row.created_at)
            ],
        )?;
        Ok(())
    }

    async fn get_backtest_row(&self, timestamp: DateTime<Utc>) -> Result<Option<BacktestRow>, StoreError> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT document FROM backtest_rows WHERE timestamp = ?1",
            params![to_ts(timestamp)],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(document) => Ok(Some(serde_json::from_str(&document)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn latest_backtest_row(&self) -> Result<Option<BacktestRow>, StoreError> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT document FROM backtest_rows ORDER BY timestamp DESC LIMIT 1",
            [],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(document) => Ok(Some(serde_json::from_str(&document)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn backtest_rows_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BacktestRow>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT document FROM backtest_rows
             WHERE timestamp >= ?1 AND timestamp < ?2
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![to_ts(start), to_ts(end)], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    async fn get_filter_cache_entry(&self, filter_hash: &str) -> Result<Option<SymbolFilterCacheEntry>, StoreError> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT document FROM filter_cache_entries WHERE filter_hash = ?1",
            params![filter_hash],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(document) => Ok(Some(serde_json::from_str(&document)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert_filter_cache_entry(&self, entry: &SymbolFilterCacheEntry) -> Result<(), StoreError> {
        let document = serde_json::to_string(entry)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO filter_cache_entries (filter_hash, document, created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(filter_hash) DO UPDATE SET
                document = excluded.document,
                last_used_at = excluded.last_used_at",
            params![
                entry.filter_hash,
                document,
                to_ts(entry.created_at),
                to_ts(entry.last_used_at)
            ],
        )?;
        Ok(())
    }

    async fn touch_filter_cache_entry(&self, filter_hash: &str, used_at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let document: Option<String> = conn
            .query_row(
                "SELECT document FROM filter_cache_entries WHERE filter_hash = ?1",
                params![filter_hash],
                |row| row.get(0),
            )
            .ok();
        let Some(document) = document else {
            return Err(StoreError::NotFound);
        };
        let mut entry: SymbolFilterCacheEntry = serde_json::from_str(&document)?;
        entry.hit_count += 1;
        entry.last_used_at = used_at;
        let updated_document = serde_json::to_string(&entry)?;
        conn.execute(
            "UPDATE filter_cache_entries SET document = ?1, last_used_at = ?2 WHERE filter_hash = ?3",
            params![updated_document, to_ts(used_at), filter_hash],
        )?;
        Ok(())
    }

    async fn purge_filter_cache(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "DELETE FROM filter_cache_entries WHERE last_used_at < ?1",
            params![to_ts(cutoff)],
        )?;
        Ok(affected as u64)
    }

    async fn insert_task(&self, task: &AsyncBacktestTask) -> Result<(), StoreError> {
        let document = serde_json::to_string(task)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO async_backtest_tasks (task_id, status, document, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                task.task_id,
                status_str(task.status),
                document,
                task.started_at.map(to_ts).unwrap_or_else(|| to_ts(Utc::now()))
            ],
        )?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<AsyncBacktestTask>, StoreError> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT document FROM async_backtest_tasks WHERE task_id = ?1",
            params![task_id],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(document) => Ok(Some(serde_json::from_str(&document)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_task(&self, task: &AsyncBacktestTask) -> Result<(), StoreError> {
        let document = serde_json::to_string(task)?;
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE async_backtest_tasks SET status = ?1, document = ?2 WHERE task_id = ?3",
            params![status_str(task.status), document, task.task_id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<AsyncBacktestTask>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT document FROM async_backtest_tasks WHERE status = ?1")?;
        let rows = stmt.query_map(params![status_str(status)], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BacktestParams, TaskStatus};

    fn sample_row(timestamp: DateTime<Utc>) -> BacktestRow {
        BacktestRow {
            timestamp,
            hour: timestamp.format("%H").to_string().parse().unwrap(),
            rankings: vec![],
            removed_symbols: vec![],
            total_market_volume: 0.0,
            total_market_quote_volume: 0.0,
            btc_price: 0.0,
            btc_price_change_24h: 0.0,
            btcdom_price: None,
            btcdom_price_change_24h: None,
            calculation_duration_ms: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_whole_document() {
        let store = SqliteObjectStore::open_in_memory().unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let mut row = sample_row(ts);
        row.total_market_volume = 1.0;
        store.upsert_backtest_row(&row).await.unwrap();

        row.total_market_volume = 2.0;
        row.btc_price = 42.0;
        store.upsert_backtest_row(&row).await.unwrap();

        let fetched = store.get_backtest_row(ts).await.unwrap().unwrap();
        assert_eq!(fetched.total_market_volume, 2.0);
        assert_eq!(fetched.btc_price, 42.0);
    }

    #[tokio::test]
    async fn latest_row_orders_by_timestamp() {
        let store = SqliteObjectStore::open_in_memory().unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        store.upsert_backtest_row(&sample_row(t1)).await.unwrap();
        store.upsert_backtest_row(&sample_row(t2)).await.unwrap();

        let latest = store.latest_backtest_row().await.unwrap().unwrap();
        assert_eq!(latest.timestamp, t2);
    }

    #[tokio::test]
    async fn task_lifecycle_round_trips() {
        let store = SqliteObjectStore::open_in_memory().unwrap();
        let task = AsyncBacktestTask {
            task_id: "t1".to_string(),
            status: TaskStatus::Pending,
            params: BacktestParams::default(),
            current_time: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            error_message: None,
            processing_time_ms: 0,
        };
        store.insert_task(&task).await.unwrap();

        let mut updated = task.clone();
        updated.status = TaskStatus::Running;
        store.update_task(&updated).await.unwrap();

        let running = store.tasks_with_status(TaskStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_id, "t1");
    }
}
