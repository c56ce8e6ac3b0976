//! `LeaderboardBuilder` (spec.md §4.5): ranks the current window snapshot,
//! attaches benchmark and futures prices, and derives market-wide stats.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::concurrency::{ConcurrencyPool, ConcurrencyPoolOptions};
use crate::market_feed::{Interval, MarketFeed};
use crate::models::{BenchmarkPrice, LeaderboardItem, MarketStats, VolumeWindow};
use crate::symbol::{decompose, resolve_futures_symbol};

const BENCHMARK_RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 3];
const FUTURES_BATCH_SIZE: usize = 30;
const FUTURES_BATCH_DELAY_MS: u64 = 300;

pub struct LeaderboardBuilder {
    feed: Arc<dyn MarketFeed>,
    futures_pool: ConcurrencyPool,
}

impl LeaderboardBuilder {
    pub fn new(feed: Arc<dyn MarketFeed>) -> Self {
        Self {
            feed,
            futures_pool: ConcurrencyPool::new(ConcurrencyPoolOptions {
                initial_concurrency: FUTURES_BATCH_SIZE,
                min_concurrency: 1,
                max_concurrency: FUTURES_BATCH_SIZE,
                adaptive: false,
                retry: true,
                max_retries: 3,
            }),
        }
    }

    /// Fetch ~26 1h candles around `t` for `symbol` and derive
    /// `{price, price24hAgo, change24h}`. Independent exponential-ish
    /// backoff (1s/2s/3s), defaulting to zero on fewer than 2 candles.
    pub async fn benchmark_price(&self, symbol: &str, t: DateTime<Utc>) -> BenchmarkPrice {
        let start = t - chrono::Duration::hours(25);
        let end = t + chrono::Duration::hours(1);

        let mut last_err = None;
        for delay_secs in BENCHMARK_RETRY_DELAYS_SECS {
            match self.feed.klines(symbol, Interval::OneHour, start, end, 30).await {
                Ok(candles) if candles.len() >= 2 => {
                    let price = candles.last().map(|c| c.open).unwrap_or(0.0);
                    let target = t - chrono::Duration::hours(24);
                    let price_24h_ago = candles
                        .iter()
                        .min_by_key(|c| (c.open_time - target).num_seconds().abs())
                        .map(|c| c.open)
                        .unwrap_or(0.0);
                    let change_24h = if price_24h_ago != 0.0 {
                        (price - price_24h_ago) / price_24h_ago * 100.0
                    } else {
                        0.0
                    };
                    return BenchmarkPrice {
                        price,
                        price_24h_ago,
                        change_24h,
                    };
                }
                Ok(_) => return BenchmarkPrice::default(),
                Err(err) => {
                    warn!(symbol, error = %err, "benchmark price fetch failed, retrying");
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                }
            }
        }
        if let Some(err) = last_err {
            warn!(symbol, error = %err, "benchmark price unavailable after retries");
        }
        BenchmarkPrice::default()
    }

    /// Build the ranked leaderboard for window snapshot `windows` at `t`,
    /// with futures prices attached, plus the accompanying market stats.
    pub async fn build(
        &self,
        windows: &HashMap<String, VolumeWindow>,
        min_volume_threshold: f64,
        perpetual_universe: &HashSet<String>,
        t: DateTime<Utc>,
        limit: usize,
    ) -> (Vec<LeaderboardItem>, MarketStats) {
        let mut ordered_symbols: Vec<&String> = windows.keys().collect();
        ordered_symbols.sort();

        let mut eligible: Vec<LeaderboardItem> = ordered_symbols
            .into_iter()
            .filter_map(|symbol| {
                let window = &windows[symbol];
                (window.is_complete() && window.quote_volume_24h >= min_volume_threshold)
                    .then(|| build_item(symbol, window))
                    .flatten()
            })
            .collect();

        // `sort_by` is stable, so symbols tying on `price_change_24h` keep
        // their pre-sort (symbol-ascending) order rather than whatever
        // order `HashMap` iteration happened to produce (spec.md §4.5,
        // invariant 7: byte-equal reruns).
        eligible.sort_by(|a, b| a.price_change_24h.partial_cmp(&b.price_change_24h).unwrap());

        let pre_truncation_total_quote_volume: f64 = eligible.iter().map(|i| i.quote_volume_24h).sum();

        let mut rankings: Vec<LeaderboardItem> = eligible.into_iter().take(limit).collect();
        for (i, item) in rankings.iter_mut().enumerate() {
            item.rank = (i + 1) as u32;
            item.market_share = if pre_truncation_total_quote_volume > 0.0 {
                item.quote_volume_24h / pre_truncation_total_quote_volume * 100.0
            } else {
                0.0
            };
        }

        self.attach_futures_prices(&mut rankings, perpetual_universe, t).await;

        let total_volume: f64 = rankings.iter().map(|i| i.volume_24h).sum();
        let total_quote_volume: f64 = rankings.iter().map(|i| i.quote_volume_24h).sum();
        let top10_quote_volume: f64 = rankings.iter().take(10).map(|i| i.quote_volume_24h).sum();
        let top10_concentration = if total_quote_volume > 0.0 {
            top10_quote_volume / total_quote_volume * 100.0
        } else {
            0.0
        };

        let stats = MarketStats {
            total_volume,
            total_quote_volume,
            top10_concentration,
        };

        (rankings, stats)
    }

    /// Resolve + attach `futurePriceAtTime` for every row (spec.md §4.5),
    /// batched at `FUTURES_BATCH_SIZE` with an inter-batch delay.
    pub async fn attach_futures_prices(
        &self,
        items: &mut [LeaderboardItem],
        perpetual_universe: &HashSet<String>,
        t: DateTime<Utc>,
    ) {
        for item in items.iter_mut() {
            item.future_symbol = resolve_futures_symbol(&item.symbol, perpetual_universe);
        }

        let unique_futures: Vec<String> = items
            .iter()
            .filter_map(|i| i.future_symbol.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let start = t - chrono::Duration::minutes(30);
        let end = t + chrono::Duration::minutes(90);

        let mut prices: HashMap<String, f64> = HashMap::new();
        for batch in unique_futures.chunks(FUTURES_BATCH_SIZE) {
            let feed = self.feed.clone();
            let result = self
                .futures_pool
                .run(batch.to_vec(), move |symbol: String| {
                    let feed = feed.clone();
                    async move { feed.futures_klines(&symbol, Interval::OneHour, start, end, 5).await }
                })
                .await;

            for (symbol, candles) in result.results {
                if let Some(candle) = candles.iter().min_by_key(|c| (c.open_time - t).num_seconds().abs()) {
                    prices.insert(symbol, candle.open);
                }
            }
            for (symbol, err) in result.errors {
                warn!(symbol, error = %err, "futures price fetch failed after retries");
            }

            tokio::time::sleep(Duration::from_millis(FUTURES_BATCH_DELAY_MS)).await;
        }

        for item in items.iter_mut() {
            if let Some(future_symbol) = &item.future_symbol {
                item.future_price_at_time = prices.get(future_symbol).copied();
            }
        }
    }
}

pub(crate) fn build_item(symbol: &str, window: &VolumeWindow) -> Option<LeaderboardItem> {
    let parts = decompose(symbol)?;
    Some(LeaderboardItem {
        rank: 0,
        symbol: symbol.to_string(),
        base_asset: parts.base_asset,
        quote_asset: parts.quote_asset,
        price_change_24h: window.price_change_24h(),
        price_at_time: window.price_at_time().unwrap_or(0.0),
        price_24h_ago: window.price_24h_ago().unwrap_or(0.0),
        volume_24h: window.volume_24h,
        quote_volume_24h: window.quote_volume_24h,
        market_share: 0.0,
        volatility_24h: window.volatility_24h(),
        high_24h: window.high_24h().unwrap_or(0.0),
        low_24h: window.low_24h().unwrap_or(0.0),
        future_symbol: None,
        future_price_at_time: None,
        funding_rate_history: Vec::new(),
        current_funding_rate: None,
    })
}
