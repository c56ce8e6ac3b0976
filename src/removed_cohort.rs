//! `RemovedCohortBuilder` (spec.md §4.6): the set of symbols present in the
//! previous period's rankings but absent from the current one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::leaderboard::build_item;
use crate::leaderboard::LeaderboardBuilder;
use crate::models::{LeaderboardItem, VolumeWindow};
use crate::store::ObjectStore;
use crate::window::WindowEngine;

pub struct RemovedCohortBuilder {
    store: Arc<dyn ObjectStore>,
}

impl RemovedCohortBuilder {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// `prev := t - granularity`. Resolve `prev`'s ranked symbol set (from
    /// the persisted row, or by recomputing it against `prev_pool` if
    /// nothing was persisted yet), diff against `current_symbols`, and
    /// materialize a LeaderboardItem per removed symbol evaluated *at* `t`.
    #[allow(clippy::too_many_arguments)]
    pub async fn build(
        &self,
        t: DateTime<Utc>,
        granularity: chrono::Duration,
        current_symbols: &HashSet<String>,
        prev_pool: &[String],
        prev_min_volume_threshold: f64,
        prev_limit: usize,
        prev_perpetual_universe: &HashSet<String>,
        window_engine: &WindowEngine,
        leaderboard_builder: &LeaderboardBuilder,
        perpetual_universe: &HashSet<String>,
    ) -> Vec<LeaderboardItem> {
        let prev = t - granularity;

        let prev_symbols = match self.store.get_backtest_row(prev).await {
            Ok(Some(row)) => row.rankings.into_iter().map(|item| item.symbol).collect::<HashSet<_>>(),
            Ok(None) => {
                self.recompute_prev_symbol_set(
                    prev,
                    prev_pool,
                    prev_min_volume_threshold,
                    prev_limit,
                    prev_perpetual_universe,
                    window_engine,
                    leaderboard_builder,
                )
                .await
            }
            Err(err) => {
                warn!(error = %err, "failed to read previous backtest row, recomputing removed cohort");
                self.recompute_prev_symbol_set(
                    prev,
                    prev_pool,
                    prev_min_volume_threshold,
                    prev_limit,
                    prev_perpetual_universe,
                    window_engine,
                    leaderboard_builder,
                )
                .await
            }
        };

        let removed: Vec<String> = prev_symbols.difference(current_symbols).cloned().collect();
        if removed.is_empty() {
            return Vec::new();
        }

        let windows = window_engine.preload(&removed, t).await;
        let mut items: Vec<LeaderboardItem> = removed
            .iter()
            .filter_map(|symbol| match windows.get(symbol) {
                Some(window) => build_removed_item(symbol, window),
                None => {
                    warn!(symbol, "removed-cohort symbol has no candles at current instant, dropping");
                    None
                }
            })
            .collect();

        leaderboard_builder
            .attach_futures_prices(&mut items, perpetual_universe, t)
            .await;

        items.sort_by(|a, b| a.price_change_24h.partial_cmp(&b.price_change_24h).unwrap());
        for (i, item) in items.iter_mut().enumerate() {
            item.rank = (i + 1) as u32;
            item.market_share = 0.0;
        }

        items
    }

    #[allow(clippy::too_many_arguments)]
    async fn recompute_prev_symbol_set(
        &self,
        prev: DateTime<Utc>,
        prev_pool: &[String],
        prev_min_volume_threshold: f64,
        prev_limit: usize,
        prev_perpetual_universe: &HashSet<String>,
        window_engine: &WindowEngine,
        leaderboard_builder: &LeaderboardBuilder,
    ) -> HashSet<String> {
        let windows: HashMap<String, VolumeWindow> = window_engine.preload(prev_pool, prev).await;
        let (rankings, _) = leaderboard_builder
            .build(&windows, prev_min_volume_threshold, prev_perpetual_universe, prev, prev_limit)
            .await;
        rankings.into_iter().map(|item| item.symbol).collect()
    }
}

fn build_removed_item(symbol: &str, window: &VolumeWindow) -> Option<LeaderboardItem> {
    build_item(symbol, window)
}
