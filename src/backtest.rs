//! `BacktestEngine` (spec.md §4.8): the top-level driver stepping through
//! period instants, building and persisting one `BacktestRow` each.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use tracing::{info, warn};

use crate::concurrency::ConcurrencyPoolOptions;
use crate::config::EngineTunables;
use crate::filter::{EligibilityFilter, FilterCache};
use crate::funding::FundingRateEnricher;
use crate::leaderboard::LeaderboardBuilder;
use crate::market_feed::{fetch_perpetual_universe, MarketFeed};
use crate::models::{BacktestParams, BacktestRow, FilterCriteria};
use crate::removed_cohort::RemovedCohortBuilder;
use crate::store::ObjectStore;
use crate::window::WindowEngine;

const BANNED_SUBSTRINGS: [&str; 4] = ["UP", "DOWN", "BULL", "BEAR"];

/// Callback surface the TaskSupervisor implements to observe and steer a
/// running engine: persisting `currentTime` after every period so a crash
/// is restartable, and signalling cooperative cancellation (spec.md §4.8
/// step 5, §4.9, §5).
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn update_current_time(&self, t: DateTime<Utc>);

    async fn is_cancelled(&self) -> bool {
        false
    }
}

pub struct BacktestEngine {
    feed: Arc<dyn MarketFeed>,
    filter_cache: FilterCache,
    eligibility: EligibilityFilter,
    window_engine: WindowEngine,
    leaderboard_builder: LeaderboardBuilder,
    removed_cohort_builder: RemovedCohortBuilder,
    funding_enricher: FundingRateEnricher,
    store: Arc<dyn ObjectStore>,
}

impl BacktestEngine {
    pub fn new(feed: Arc<dyn MarketFeed>, store: Arc<dyn ObjectStore>, tunables: &EngineTunables) -> Self {
        let pool_options = ConcurrencyPoolOptions::from(&tunables.pool);
        let request_delay = std::time::Duration::from_millis(tunables.binance_request_delay_ms);

        Self {
            feed: feed.clone(),
            filter_cache: FilterCache::new(store.clone()),
            eligibility: EligibilityFilter::new(feed.clone(), pool_options.clone(), request_delay),
            window_engine: WindowEngine::new(feed.clone(), pool_options, tunables.window_batch_size),
            leaderboard_builder: LeaderboardBuilder::new(feed.clone()),
            removed_cohort_builder: RemovedCohortBuilder::new(store.clone()),
            funding_enricher: FundingRateEnricher::new(feed),
            store,
        }
    }

    /// Step through `[params.startTime, params.endTime)` at
    /// `granularityHours`, persisting one row per instant. Per-period
    /// failures are logged and skipped; filter/discovery failures abort the
    /// whole run (spec.md §4.8).
    pub async fn run(&self, params: &BacktestParams, progress: Option<&dyn ProgressSink>) -> anyhow::Result<()> {
        anyhow::ensure!(params.end_time >= params.start_time, "endTime must not precede startTime");
        if params.end_time == params.start_time {
            info!(t = %params.start_time, "empty backtest range requested, no periods to run");
            return Ok(());
        }
        if (params.end_time - params.start_time) > chrono::Duration::days(180) {
            warn!(start = %params.start_time, end = %params.end_time, "long backtest range requested");
        }

        let weekly_instants = enumerate_weekly_instants(params.start_time, params.end_time);
        let universe = self
            .discover_universe(params)
            .await
            .context("failed to discover active symbol universe")?;
        let perpetual_universe = fetch_perpetual_universe(self.feed.as_ref()).await;

        let mut week_pools: HashMap<DateTime<Utc>, Vec<String>> = HashMap::new();
        let candidates: Vec<String> = universe.iter().cloned().collect();
        for monday in &weekly_instants {
            let criteria = FilterCriteria {
                reference_time: *monday,
                quote_asset: params.quote_asset.clone(),
                min_volume_threshold: params.min_volume_threshold,
                min_history_days: params.min_history_days,
                require_futures: true,
                exclude_stablecoins: true,
                include_inactive: false,
            };
            let entry = self
                .filter_cache
                .resolve(&criteria, &candidates, &self.eligibility)
                .await
                .context("eligibility filter resolution failed")?;
            week_pools.insert(*monday, entry.valid_symbols);
        }

        let granularity = chrono::Duration::hours(params.granularity_hours);
        let mut t = params.start_time;
        while t < params.end_time {
            if let Some(sink) = progress {
                if sink.is_cancelled().await {
                    info!(t = %t, "backtest cancelled, stopping before next period");
                    break;
                }
            }

            if let Err(err) = self.run_period(t, params, &week_pools, &perpetual_universe).await {
                warn!(t = %t, error = %err, "period failed, continuing to next period");
            }

            if let Some(sink) = progress {
                sink.update_current_time(t).await;
            }

            t += granularity;
        }

        Ok(())
    }

    async fn run_period(
        &self,
        t: DateTime<Utc>,
        params: &BacktestParams,
        week_pools: &HashMap<DateTime<Utc>, Vec<String>>,
        perpetual_universe: &HashSet<String>,
    ) -> anyhow::Result<()> {
        let started = std::time::Instant::now();
        let week = monday_at_or_before(t);
        let Some(pool) = week_pools.get(&week) else {
            warn!(t = %t, week = %week, "no symbol pool resolved for this week, skipping period");
            return Ok(());
        };
        if pool.is_empty() {
            warn!(t = %t, week = %week, "empty symbol pool for this week, skipping period");
            return Ok(());
        }

        let windows = self.window_engine.preload(pool, t).await;

        let btc_price = self.leaderboard_builder.benchmark_price("BTCUSDT", t).await;
        let btcdom_price = self.leaderboard_builder.benchmark_price("BTCDOMUSDT", t).await;
        let btcdom_known = btcdom_price.price != 0.0 || btcdom_price.price_24h_ago != 0.0;

        let (mut rankings, market_stats) = self
            .leaderboard_builder
            .build(&windows, params.min_volume_threshold, perpetual_universe, t, params.limit)
            .await;

        let current_symbols: HashSet<String> = rankings.iter().map(|i| i.symbol.clone()).collect();
        let prev_week = monday_at_or_before(t - chrono::Duration::hours(params.granularity_hours));
        let prev_pool = week_pools.get(&prev_week).cloned().unwrap_or_default();

        let removed_symbols = self
            .removed_cohort_builder
            .build(
                t,
                chrono::Duration::hours(params.granularity_hours),
                &current_symbols,
                &prev_pool,
                params.min_volume_threshold,
                params.limit,
                perpetual_universe,
                &self.window_engine,
                &self.leaderboard_builder,
                perpetual_universe,
            )
            .await;

        self.funding_enricher
            .enrich(&mut rankings, t, params.granularity_hours)
            .await;

        let row = BacktestRow {
            timestamp: t,
            hour: t.hour(),
            rankings,
            removed_symbols,
            total_market_volume: market_stats.total_volume,
            total_market_quote_volume: market_stats.total_quote_volume,
            btc_price: btc_price.price,
            btc_price_change_24h: btc_price.change_24h,
            btcdom_price: btcdom_known.then_some(btcdom_price.price),
            btcdom_price_change_24h: btcdom_known.then_some(btcdom_price.change_24h),
            calculation_duration_ms: started.elapsed().as_millis() as i64,
            created_at: Utc::now(),
        };

        self.store.upsert_backtest_row(&row).await.context("failed to persist backtest row")?;
        Ok(())
    }

    async fn discover_universe(&self, params: &BacktestParams) -> anyhow::Result<HashSet<String>> {
        let spot_symbols = self.feed.exchange_info().await.context("exchange_info call failed")?;
        let mut universe: HashSet<String> = spot_symbols
            .into_iter()
            .filter(|s| s.status == "TRADING" && s.quote_asset == params.quote_asset)
            .map(|s| s.symbol)
            .filter(|symbol| !BANNED_SUBSTRINGS.iter().any(|banned| symbol.contains(*banned)))
            .collect();

        if let Some(allowed) = &params.symbols {
            let allowed_set: HashSet<String> = allowed.iter().cloned().collect();
            universe = universe.intersection(&allowed_set).cloned().collect();
        }

        Ok(universe)
    }
}

pub(crate) fn monday_at_or_before(t: DateTime<Utc>) -> DateTime<Utc> {
    let date = t.date_naive();
    let days_from_monday = date.weekday().num_days_from_monday();
    let monday_date = date - chrono::Duration::days(days_from_monday as i64);
    Utc.from_utc_datetime(&monday_date.and_hms_opt(0, 0, 0).unwrap())
}

pub(crate) fn enumerate_weekly_instants(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let mut weeks = Vec::new();
    let mut current = monday_at_or_before(start);
    while current <= end {
        weeks.push(current);
        current += chrono::Duration::days(7);
    }
    weeks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monday_at_or_before_steps_back_to_monday() {
        let wednesday = Utc.with_ymd_and_hms(2024, 6, 5, 13, 0, 0).unwrap();
        let monday = monday_at_or_before(wednesday);
        assert_eq!(monday.weekday(), chrono::Weekday::Mon);
        assert_eq!(monday.hour(), 0);
        assert!(monday <= wednesday);
    }

    #[test]
    fn enumerate_weekly_instants_covers_range() {
        let start = Utc.with_ymd_and_hms(2024, 6, 5, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 6, 20, 0, 0, 0).unwrap();
        let weeks = enumerate_weekly_instants(start, end);
        assert!(weeks.len() >= 3);
        assert!(weeks.windows(2).all(|w| (w[1] - w[0]).num_days() == 7));
    }
}
