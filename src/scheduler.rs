//! `Scheduler` (spec.md §4.10): fires at fixed wall-clock instants, derives
//! the next span from persisted state, and dispatches at most one live
//! backtest task at a time.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{info, warn};

use crate::backfill::backfill_funding_rates;
use crate::market_feed::MarketFeed;
use crate::models::{BacktestParams, TaskStatus};
use crate::store::ObjectStore;
use crate::supervisor::TaskSupervisor;

const CANONICAL_HOURS: [u32; 3] = [0, 8, 16];
const BACKFILL_LOOKBACK_DAYS: i64 = 2;

pub struct Scheduler {
    feed: Arc<dyn MarketFeed>,
    store: Arc<dyn ObjectStore>,
    supervisor: Arc<TaskSupervisor>,
}

impl Scheduler {
    pub fn new(feed: Arc<dyn MarketFeed>, store: Arc<dyn ObjectStore>, supervisor: Arc<TaskSupervisor>) -> Self {
        Self { feed, store, supervisor }
    }

    /// Run one fire of the schedule: gate on live tasks, derive the next
    /// span, backfill, and dispatch. Intended to be called by a process
    /// whose own clock triggers it at `00:10/08:10/16:10 UTC` (SPEC_FULL.md
    /// §A.3: the wall-clock trigger itself is outside this crate's scope —
    /// the binary entrypoint owns the sleep-until-next-fire loop).
    pub async fn fire(&self) -> anyhow::Result<()> {
        if self.has_live_task().await? {
            info!("scheduler fire skipped: a task is already pending or running");
            return Ok(());
        }

        let now = Utc::now();
        let start_time = match self.store.latest_backtest_row().await? {
            Some(row) => row.timestamp + chrono::Duration::hours(8),
            None => Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        };
        let end_time = next_canonical_boundary_after(now);

        if start_time >= end_time {
            warn!(start_time = %start_time, end_time = %end_time, "scheduler span is empty, skipping fire");
            return Ok(());
        }

        let since = (now - chrono::Duration::days(BACKFILL_LOOKBACK_DAYS)).min(start_time);
        match backfill_funding_rates(self.feed.clone(), self.store.clone(), since, 8).await {
            Ok(count) => info!(count, "pre-dispatch funding backfill complete"),
            Err(err) => warn!(error = %err, "pre-dispatch funding backfill failed, dispatching anyway"),
        }

        let params = BacktestParams {
            start_time,
            end_time,
            symbols: None,
            limit: 30,
            min_volume_threshold: 400_000.0,
            quote_asset: "USDT".to_string(),
            min_history_days: 365,
            granularity_hours: 8,
        };

        let task_id = self.supervisor.start_async(params).await?;
        info!(task_id, start_time = %start_time, end_time = %end_time, "scheduler dispatched backtest task");
        Ok(())
    }

    async fn has_live_task(&self) -> anyhow::Result<bool> {
        let pending = self.store.tasks_with_status(TaskStatus::Pending).await?;
        if !pending.is_empty() {
            return Ok(true);
        }
        let running = self.store.tasks_with_status(TaskStatus::Running).await?;
        Ok(!running.is_empty())
    }
}

fn next_canonical_boundary_after(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    for hour in CANONICAL_HOURS {
        let candidate = Utc.from_utc_datetime(&today.and_hms_opt(hour, 0, 0).unwrap());
        if candidate > now {
            return candidate;
        }
    }
    let tomorrow = today + chrono::Duration::days(1);
    Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_boundary_steps_to_same_day_if_before_8am() {
        let t = Utc.with_ymd_and_hms(2024, 6, 5, 3, 0, 0).unwrap();
        assert_eq!(next_canonical_boundary_after(t), Utc.with_ymd_and_hms(2024, 6, 5, 8, 0, 0).unwrap());
    }

    #[test]
    fn next_boundary_rolls_to_next_day_after_4pm() {
        let t = Utc.with_ymd_and_hms(2024, 6, 5, 20, 0, 0).unwrap();
        assert_eq!(next_canonical_boundary_after(t), Utc.with_ymd_and_hms(2024, 6, 6, 0, 0, 0).unwrap());
    }

    #[test]
    fn next_boundary_is_strictly_after_exact_match() {
        let t = Utc.with_ymd_and_hms(2024, 6, 5, 8, 0, 0).unwrap();
        assert_eq!(next_canonical_boundary_after(t), Utc.with_ymd_and_hms(2024, 6, 5, 16, 0, 0).unwrap());
    }
}
