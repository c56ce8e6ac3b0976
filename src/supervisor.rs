//! `TaskSupervisor` (spec.md §4.9): owns the lifecycle of asynchronous
//! backtest runs — start, progress, cancel, resume, cleanup.
//!
//! Grounded on the teacher's task-lifecycle pattern in
//! `route_quality::async_jobs` (a UUID-keyed record with a status enum
//! persisted through every transition, a cooperative cancellation flag
//! checked by the worker rather than a hard abort).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backtest::{BacktestEngine, ProgressSink};
use crate::config::EngineTunables;
use crate::market_feed::MarketFeed;
use crate::models::{AsyncBacktestTask, BacktestParams, TaskStatus};
use crate::store::ObjectStore;

/// In-memory cancellation flags for tasks currently running in this
/// process. A task started by a previous process instance that crashed
/// mid-run has no entry here and is surfaced by `list_interrupted` instead.
#[derive(Default)]
struct CancellationRegistry {
    flags: Mutex<HashMap<String, Arc<std::sync::atomic::AtomicBool>>>,
}

impl CancellationRegistry {
    fn register(&self, task_id: &str) -> Arc<std::sync::atomic::AtomicBool> {
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        self.flags.lock().insert(task_id.to_string(), flag.clone());
        flag
    }

    fn cancel(&self, task_id: &str) -> bool {
        if let Some(flag) = self.flags.lock().get(task_id) {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    fn forget(&self, task_id: &str) {
        self.flags.lock().remove(task_id);
    }
}

struct TaskProgressSink {
    store: Arc<dyn ObjectStore>,
    task_id: String,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl ProgressSink for TaskProgressSink {
    async fn update_current_time(&self, t: chrono::DateTime<Utc>) {
        match self.store.get_task(&self.task_id).await {
            Ok(Some(mut task)) => {
                task.current_time = Some(t);
                if let Err(err) = self.store.update_task(&task).await {
                    warn!(task_id = %self.task_id, error = %err, "failed to persist task progress");
                }
            }
            Ok(None) => warn!(task_id = %self.task_id, "task disappeared while updating progress"),
            Err(err) => warn!(task_id = %self.task_id, error = %err, "failed to read task for progress update"),
        }
    }

    async fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }
}

pub struct TaskSupervisor {
    feed: Arc<dyn MarketFeed>,
    store: Arc<dyn ObjectStore>,
    tunables: EngineTunables,
    cancellation: Arc<CancellationRegistry>,
}

impl TaskSupervisor {
    pub fn new(feed: Arc<dyn MarketFeed>, store: Arc<dyn ObjectStore>, tunables: EngineTunables) -> Self {
        Self {
            feed,
            store,
            tunables,
            cancellation: Arc::new(CancellationRegistry::default()),
        }
    }

    /// Create a `Pending` task row, spawn the backtest on the Tokio runtime,
    /// and return its id immediately. The caller polls `get_progress`.
    pub async fn start_async(&self, params: BacktestParams) -> anyhow::Result<String> {
        let task_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let task = AsyncBacktestTask {
            task_id: task_id.clone(),
            status: TaskStatus::Pending,
            params: params.clone(),
            current_time: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            processing_time_ms: 0,
        };
        self.store.insert_task(&task).await?;

        let flag = self.cancellation.register(&task_id);
        let feed = self.feed.clone();
        let store = self.store.clone();
        let tunables = self.tunables.clone();
        let cancellation = self.cancellation.clone();
        let spawned_task_id = task_id.clone();

        tokio::spawn(async move {
            run_task(feed, store, tunables, spawned_task_id.clone(), params, flag).await;
            cancellation.forget(&spawned_task_id);
        });

        Ok(task_id)
    }

    /// Returns the stored task row with `processingTimeMs` recomputed as
    /// `now - startedAt` while `status == Running`, so a caller polling a
    /// long-running task sees live elapsed time rather than a stale value
    /// from the last persisted update (spec.md §4.9).
    pub async fn get_progress(&self, task_id: &str) -> anyhow::Result<Option<AsyncBacktestTask>> {
        let task = self.store.get_task(task_id).await?;
        Ok(task.map(|mut task| {
            if task.status == TaskStatus::Running {
                if let Some(started_at) = task.started_at {
                    task.processing_time_ms = (Utc::now() - started_at).num_milliseconds().max(0);
                }
            }
            task
        }))
    }

    /// Flip the in-memory cancellation flag for a running task. Cooperative:
    /// the engine observes it at the next period boundary (spec.md §4.8
    /// step 5). No-op (returns `false`) if the task isn't running in this
    /// process.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.cancellation.cancel(task_id)
    }

    /// Resume a task left `Running` by a crashed process: re-derive its
    /// remaining span from `current_time` (or `params.start_time` if never
    /// updated) and spawn a fresh run with the same `task_id`.
    pub async fn resume(&self, task_id: &str) -> anyhow::Result<()> {
        let Some(mut task) = self.store.get_task(task_id).await? else {
            anyhow::bail!("no such task: {task_id}");
        };
        anyhow::ensure!(
            matches!(task.status, TaskStatus::Running | TaskStatus::Pending),
            "task {task_id} is not resumable from status {:?}",
            task.status
        );

        let resume_from = task.current_time.unwrap_or(task.params.start_time);
        let mut resumed_params = task.params.clone();
        resumed_params.start_time = resume_from;

        task.status = TaskStatus::Running;
        task.started_at = Some(task.started_at.unwrap_or_else(Utc::now));
        self.store.update_task(&task).await?;

        let flag = self.cancellation.register(task_id);
        let feed = self.feed.clone();
        let store = self.store.clone();
        let tunables = self.tunables.clone();
        let cancellation = self.cancellation.clone();
        let spawned_task_id = task_id.to_string();

        tokio::spawn(async move {
            run_task(feed, store, tunables, spawned_task_id.clone(), resumed_params, flag).await;
            cancellation.forget(&spawned_task_id);
        });

        Ok(())
    }

    /// Purge filter-cache entries older than `filter_cache_ttl_days`
    /// (spec.md §4.3 `cleanupFilterCache`, invoked as routine maintenance
    /// alongside task supervision).
    pub async fn cleanup(&self) -> anyhow::Result<u64> {
        let cache = crate::filter::FilterCache::new(self.store.clone());
        Ok(cache.cleanup(self.tunables.filter_cache_ttl_days).await?)
    }

    /// Tasks left `Running` with no corresponding in-memory cancellation
    /// flag: a process crash mid-run (spec.md §4.9).
    pub async fn list_interrupted(&self) -> anyhow::Result<Vec<AsyncBacktestTask>> {
        let running = self.store.tasks_with_status(TaskStatus::Running).await?;
        Ok(running
            .into_iter()
            .filter(|t| !self.cancellation.flags.lock().contains_key(&t.task_id))
            .collect())
    }

    /// Mark every currently-interrupted task `Failed` with an explanatory
    /// message, so stale `Running` rows don't linger forever.
    pub async fn cleanup_all_interrupted(&self) -> anyhow::Result<usize> {
        let interrupted = self.list_interrupted().await?;
        let count = interrupted.len();
        for mut task in interrupted {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
            task.error_message = Some("task was interrupted by a process restart".to_string());
            if let Err(err) = self.store.update_task(&task).await {
                error!(task_id = %task.task_id, error = %err, "failed to mark interrupted task as failed");
            }
        }
        Ok(count)
    }
}

async fn run_task(
    feed: Arc<dyn MarketFeed>,
    store: Arc<dyn ObjectStore>,
    tunables: EngineTunables,
    task_id: String,
    params: BacktestParams,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
) {
    let started = std::time::Instant::now();

    let mut task = match store.get_task(&task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            error!(task_id, "task vanished before run started");
            return;
        }
        Err(err) => {
            error!(task_id, error = %err, "failed to load task before run started");
            return;
        }
    };
    task.status = TaskStatus::Running;
    task.started_at = Some(Utc::now());
    if let Err(err) = store.update_task(&task).await {
        error!(task_id, error = %err, "failed to mark task running");
        return;
    }

    let engine = BacktestEngine::new(feed, store.clone(), &tunables);
    let sink = TaskProgressSink {
        store: store.clone(),
        task_id: task_id.clone(),
        cancelled: cancelled.clone(),
    };

    let result = engine.run(&params, Some(&sink)).await;

    let Ok(Some(mut task)) = store.get_task(&task_id).await else {
        error!(task_id, "task vanished before completion could be recorded");
        return;
    };
    task.processing_time_ms = started.elapsed().as_millis() as i64;
    task.completed_at = Some(Utc::now());
    task.status = if cancelled.load(std::sync::atomic::Ordering::SeqCst) {
        TaskStatus::Cancelled
    } else {
        match &result {
            Ok(()) => TaskStatus::Completed,
            Err(_) => TaskStatus::Failed,
        }
    };
    if let Err(err) = &result {
        task.error_message = Some(err.to_string());
    }

    if let Err(err) = store.update_task(&task).await {
        error!(task_id, error = %err, "failed to persist final task state");
    } else {
        info!(task_id, status = ?task.status, "backtest task finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_feed::{ContractType, FuturesSymbolInfo, Interval, SpotSymbolInfo};
    use crate::models::Candle;
    use crate::store::sqlite::SqliteObjectStore;
    use chrono::TimeZone;

    struct EmptyFeed;

    #[async_trait]
    impl MarketFeed for EmptyFeed {
        async fn exchange_info(&self) -> Result<Vec<SpotSymbolInfo>, crate::error::MarketFeedError> {
            Ok(vec![])
        }
        async fn futures_exchange_info(&self) -> Result<Vec<FuturesSymbolInfo>, crate::error::MarketFeedError> {
            let _ = ContractType::Perpetual;
            Ok(vec![])
        }
        async fn klines(
            &self,
            _symbol: &str,
            _interval: Interval,
            _start_time: chrono::DateTime<Utc>,
            _end_time: chrono::DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<Candle>, crate::error::MarketFeedError> {
            Ok(vec![])
        }
        async fn futures_klines(
            &self,
            _symbol: &str,
            _interval: Interval,
            _start_time: chrono::DateTime<Utc>,
            _end_time: chrono::DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<Candle>, crate::error::MarketFeedError> {
            Ok(vec![])
        }
        async fn funding_rate_history(
            &self,
            _symbol: &str,
            _start_time: chrono::DateTime<Utc>,
            _end_time: chrono::DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<crate::models::FundingRateObservation>, crate::error::MarketFeedError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn start_async_persists_pending_then_completed_task() {
        let feed: Arc<dyn MarketFeed> = Arc::new(EmptyFeed);
        let store: Arc<dyn ObjectStore> = Arc::new(SqliteObjectStore::open_in_memory().unwrap());
        let supervisor = TaskSupervisor::new(feed, store, EngineTunables::default());

        let params = BacktestParams {
            start_time: Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2024, 6, 3, 8, 0, 0).unwrap(),
            ..Default::default()
        };
        let task_id = supervisor.start_async(params).await.unwrap();

        // Allow the spawned task to run to completion (empty universe, no
        // periods to execute, so this settles almost immediately).
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let progress = supervisor.get_progress(&task_id).await.unwrap();
        assert!(progress.is_some());
    }

    #[tokio::test]
    async fn cancel_returns_false_for_unknown_task() {
        let feed: Arc<dyn MarketFeed> = Arc::new(EmptyFeed);
        let store: Arc<dyn ObjectStore> = Arc::new(SqliteObjectStore::open_in_memory().unwrap());
        let supervisor = TaskSupervisor::new(feed, store, EngineTunables::default());

        assert!(!supervisor.cancel("not-a-real-task"));
    }
}
