//! `WindowEngine` (spec.md §4.4): batched preload of 24h candle windows.
//!
//! Grounded on the batch-then-sleep preload loop in the teacher's
//! `scrapers::binance_price_feed` symbol warm-up pass, generalized to run
//! each batch through `ConcurrencyPool` instead of a fixed worker count.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::concurrency::{ConcurrencyPool, ConcurrencyPoolOptions};
use crate::error::MarketFeedError;
use crate::market_feed::{Interval, MarketFeed};
use crate::models::VolumeWindow;

pub struct WindowEngine {
    feed: Arc<dyn MarketFeed>,
    pool: ConcurrencyPool,
    batch_size: usize,
    inter_batch_delay: Duration,
}

impl WindowEngine {
    pub fn new(feed: Arc<dyn MarketFeed>, pool_options: ConcurrencyPoolOptions, batch_size: usize) -> Self {
        Self {
            feed,
            pool: ConcurrencyPool::new(pool_options),
            batch_size: batch_size.max(1),
            inter_batch_delay: Duration::from_millis(500),
        }
    }

    /// Load each symbol's trailing 24x 1h candles ending at `t`. Symbols
    /// whose fetch yields zero candles are evicted (logged, not returned).
    pub async fn preload(&self, symbols: &[String], t: DateTime<Utc>) -> HashMap<String, VolumeWindow> {
        let mut windows = HashMap::with_capacity(symbols.len());
        let start = t - chrono::Duration::hours(24);

        let batches: Vec<Vec<String>> = symbols
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let batch_count = batches.len();

        for (i, batch) in batches.into_iter().enumerate() {
            let feed = self.feed.clone();
            let result = self
                .pool
                .run(batch, move |symbol: String| {
                    let feed = feed.clone();
                    async move { feed.klines(&symbol, Interval::OneHour, start, t, 24).await }
                })
                .await;

            for (symbol, candles) in result.results {
                if candles.is_empty() {
                    warn!(symbol, "window preload yielded zero candles, evicting");
                    continue;
                }
                windows.insert(symbol, VolumeWindow::from_candles(candles));
            }
            for (symbol, err) in result.errors {
                warn!(symbol, error = %err, "window preload failed after retries, evicting");
            }

            if i + 1 < batch_count {
                tokio::time::sleep(self.inter_batch_delay).await;
            }
        }

        windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_feed::{ContractType, FuturesSymbolInfo, SpotSymbolInfo};
    use crate::models::{Candle, FundingRateObservation};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct FakeFeed {
        candles: Mutex<BTreeMap<String, Vec<Candle>>>,
    }

    #[async_trait]
    impl MarketFeed for FakeFeed {
        async fn exchange_info(&self) -> Result<Vec<SpotSymbolInfo>, MarketFeedError> {
            Ok(vec![])
        }
        async fn futures_exchange_info(&self) -> Result<Vec<FuturesSymbolInfo>, MarketFeedError> {
            let _ = ContractType::Perpetual;
            Ok(vec![])
        }
        async fn klines(
            &self,
            symbol: &str,
            _interval: Interval,
            _start_time: DateTime<Utc>,
            _end_time: DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<Candle>, MarketFeedError> {
            Ok(self.candles.lock().unwrap().get(symbol).cloned().unwrap_or_default())
        }
        async fn futures_klines(
            &self,
            _symbol: &str,
            _interval: Interval,
            _start_time: DateTime<Utc>,
            _end_time: DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<Candle>, MarketFeedError> {
            Ok(vec![])
        }
        async fn funding_rate_history(
            &self,
            _symbol: &str,
            _start_time: DateTime<Utc>,
            _end_time: DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<FundingRateObservation>, MarketFeedError> {
            Ok(vec![])
        }
    }

    fn candle(open_time: DateTime<Utc>) -> Candle {
        Candle {
            open_time,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            close_time: open_time + chrono::Duration::hours(1),
            quote_volume: 1.0,
            trades: 1,
            taker_buy_volume: 0.5,
            taker_buy_quote_volume: 0.5,
        }
    }

    #[tokio::test]
    async fn evicts_symbols_with_no_candles() {
        let t = Utc::now();
        let mut candles = BTreeMap::new();
        candles.insert("ETHUSDT".to_string(), vec![candle(t - chrono::Duration::hours(1))]);

        let feed: Arc<dyn MarketFeed> = Arc::new(FakeFeed {
            candles: Mutex::new(candles),
        });
        let engine = WindowEngine::new(feed, ConcurrencyPoolOptions::default(), 40);

        let windows = engine
            .preload(&["ETHUSDT".to_string(), "DEADUSDT".to_string()], t)
            .await;

        assert!(windows.contains_key("ETHUSDT"));
        assert!(!windows.contains_key("DEADUSDT"));
    }
}
