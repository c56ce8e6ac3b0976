//! End-to-end exercise of `BacktestEngine` against an in-memory
//! `MarketFeed` fake and the real `SqliteObjectStore` (in-memory mode).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Timelike, Utc};
use leaderboard_backtest::backtest::BacktestEngine;
use leaderboard_backtest::config::EngineTunables;
use leaderboard_backtest::error::MarketFeedError;
use leaderboard_backtest::market_feed::{ContractType, FuturesSymbolInfo, Interval, MarketFeed, SpotSymbolInfo};
use leaderboard_backtest::models::{BacktestParams, Candle, FundingRateObservation};
use leaderboard_backtest::store::sqlite::SqliteObjectStore;
use leaderboard_backtest::store::ObjectStore;

/// Candles keyed by `(symbol, interval)` so the eligibility filter's daily
/// history probe and the window engine's hourly preload can be seeded
/// independently for the same symbol.
struct FixtureFeed {
    spot_symbols: Vec<SpotSymbolInfo>,
    perpetuals: Vec<String>,
    daily_candles: HashMap<String, Vec<Candle>>,
    hourly_candles: Mutex<HashMap<String, Vec<Candle>>>,
}

fn hourly_series(end: DateTime<Utc>, hours: i64, base_price: f64, quote_volume: f64) -> Vec<Candle> {
    (0..hours)
        .map(|i| {
            let open_time = end - chrono::Duration::hours(hours - i);
            Candle {
                open_time,
                open: base_price + i as f64,
                high: base_price + i as f64 + 1.0,
                low: base_price + i as f64 - 1.0,
                close: base_price + i as f64,
                volume: 10.0,
                close_time: open_time + chrono::Duration::hours(1),
                quote_volume,
                trades: 100,
                taker_buy_volume: 5.0,
                taker_buy_quote_volume: quote_volume / 2.0,
            }
        })
        .collect()
}

fn daily_series(probe_start: DateTime<Utc>, days: i64) -> Vec<Candle> {
    (0..days)
        .map(|i| {
            let open_time = probe_start + chrono::Duration::days(i);
            Candle {
                open_time,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
                close_time: open_time + chrono::Duration::days(1),
                quote_volume: 1.0,
                trades: 1,
                taker_buy_volume: 0.5,
                taker_buy_quote_volume: 0.5,
            }
        })
        .collect()
}

#[async_trait]
impl MarketFeed for FixtureFeed {
    async fn exchange_info(&self) -> Result<Vec<SpotSymbolInfo>, MarketFeedError> {
        Ok(self.spot_symbols.clone())
    }

    async fn futures_exchange_info(&self) -> Result<Vec<FuturesSymbolInfo>, MarketFeedError> {
        Ok(self
            .perpetuals
            .iter()
            .map(|s| FuturesSymbolInfo {
                symbol: s.clone(),
                status: "TRADING".to_string(),
                contract_type: ContractType::Perpetual,
            })
            .collect())
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: Interval,
        _start_time: DateTime<Utc>,
        _end_time: DateTime<Utc>,
        _limit: u32,
    ) -> Result<Vec<Candle>, MarketFeedError> {
        match interval {
            Interval::OneDay => Ok(self.daily_candles.get(symbol).cloned().unwrap_or_default()),
            Interval::OneHour => Ok(self.hourly_candles.lock().unwrap().get(symbol).cloned().unwrap_or_default()),
        }
    }

    async fn futures_klines(
        &self,
        symbol: &str,
        interval: Interval,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Candle>, MarketFeedError> {
        self.klines(symbol, interval, start_time, end_time, limit).await
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

#[tokio::test]
async fn full_backtest_run_persists_a_ranked_row() {
    let t_end = Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap();
    let t_ref = t_end - chrono::Duration::hours(8); // week-resolution reference instant for eligibility
    let probe_start = t_ref - chrono::Duration::days(365);

    let mut daily_candles = HashMap::new();
    daily_candles.insert("AAAUSDT".to_string(), daily_series(probe_start, 370));
    daily_candles.insert("BBBUSDT".to_string(), daily_series(probe_start, 370));

    let mut hourly_candles = HashMap::new();
    hourly_candles.insert("AAAUSDT".to_string(), hourly_series(t_end, 24, 100.0, 500_000.0));
    hourly_candles.insert("BBBUSDT".to_string(), hourly_series(t_end, 24, 200.0, 500_000.0));
    hourly_candles.insert("BTCUSDT".to_string(), hourly_series(t_end, 30, 60_000.0, 1_000_000.0));
    hourly_candles.insert("BTCDOMUSDT".to_string(), hourly_series(t_end, 30, 1_000.0, 1_000_000.0));

    let feed: Arc<dyn MarketFeed> = Arc::new(FixtureFeed {
        spot_symbols: vec![
            SpotSymbolInfo {
                symbol: "AAAUSDT".to_string(),
                status: "TRADING".to_string(),
                quote_asset: "USDT".to_string(),
            },
            SpotSymbolInfo {
                symbol: "BBBUSDT".to_string(),
                status: "TRADING".to_string(),
                quote_asset: "USDT".to_string(),
            },
        ],
        perpetuals: vec!["AAAUSDT".to_string(), "BBBUSDT".to_string()],
        daily_candles,
        hourly_candles: Mutex::new(hourly_candles),
    });
    let store: Arc<dyn ObjectStore> = Arc::new(SqliteObjectStore::open_in_memory().unwrap());

    let mut tunables = EngineTunables::default();
    tunables.pool.adaptive = false;
    tunables.binance_request_delay_ms = 0;

    let engine = BacktestEngine::new(feed, store.clone(), &tunables);

    let params = BacktestParams {
        start_time: t_ref,
        end_time: t_end,
        symbols: Some(vec!["AAAUSDT".to_string(), "BBBUSDT".to_string()]),
        limit: 10,
        min_volume_threshold: 0.0,
        quote_asset: "USDT".to_string(),
        min_history_days: 365,
        granularity_hours: 8,
    };

    engine.run(&params, None).await.expect("backtest run should succeed");

    let row = store
        .get_backtest_row(params.start_time)
        .await
        .unwrap()
        .expect("row should have been persisted for the period instant");

    assert!(!row.rankings.is_empty());
    assert!(row.rankings.iter().all(|item| item.rank >= 1));
    assert_eq!(row.hour, params.start_time.hour());
}
