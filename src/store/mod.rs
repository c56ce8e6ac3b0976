//! `ObjectStore` capability (spec.md §6): an indexed collection with
//! equality/range queries on a timestamp field, plus upsert.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{AsyncBacktestTask, BacktestRow, SymbolFilterCacheEntry, TaskStatus};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Replace the whole document at `row.timestamp` on conflict — the
    /// idempotency requirement of spec.md §9.
    async fn upsert_backtest_row(&self, row: &BacktestRow) -> Result<(), StoreError>;

    async fn get_backtest_row(&self, timestamp: DateTime<Utc>) -> Result<Option<BacktestRow>, StoreError>;

    /// Most recently persisted row by `timestamp`, used by the scheduler
    /// (spec.md §4.10 step 2) to resolve the next run's `startTime`.
    async fn latest_backtest_row(&self) -> Result<Option<BacktestRow>, StoreError>;

    async fn backtest_rows_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BacktestRow>, StoreError>;

    async fn get_filter_cache_entry(&self, filter_hash: &str) -> Result<Option<SymbolFilterCacheEntry>, StoreError>;

    async fn upsert_filter_cache_entry(&self, entry: &SymbolFilterCacheEntry) -> Result<(), StoreError>;

    async fn touch_filter_cache_entry(&self, filter_hash: &str, used_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Delete cache entries whose `last_used_at` predates `cutoff`; returns
    /// the number of entries purged (spec.md §4.3 `cleanupFilterCache`).
    async fn purge_filter_cache(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn insert_task(&self, task: &AsyncBacktestTask) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<AsyncBacktestTask>, StoreError>;

    async fn update_task(&self, task: &AsyncBacktestTask) -> Result<(), StoreError>;

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<AsyncBacktestTask>, StoreError>;
}
