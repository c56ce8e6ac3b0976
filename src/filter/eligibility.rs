//! `EligibilityFilter` (spec.md §4.2): partitions a candidate symbol set
//! into `{valid, invalid, reasons}` against a reference instant.
//!
//! Grounded on the batched, rate-limited probing in the teacher's
//! `route_quality::prober` (one cheap batch call up front to resolve a
//! reference set, then a per-item job pool with a fixed inter-request
//! delay to respect an IP-level budget).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::concurrency::{ConcurrencyPool, ConcurrencyPoolOptions};
use crate::error::MarketFeedError;
use crate::market_feed::{Interval, MarketFeed};
use crate::models::FilterCriteria;
use crate::symbol::{decompose, is_stablecoin_base, resolve_futures_symbol};

#[derive(Debug, Clone, Default)]
pub struct EligibilityOutcome {
    pub valid: Vec<String>,
    pub invalid: Vec<String>,
    pub reasons: BTreeMap<String, Vec<String>>,
}

pub struct EligibilityFilter {
    feed: Arc<dyn MarketFeed>,
    pool: ConcurrencyPool,
    request_delay: Duration,
}

impl EligibilityFilter {
    pub fn new(feed: Arc<dyn MarketFeed>, pool_options: ConcurrencyPoolOptions, request_delay: Duration) -> Self {
        Self {
            feed,
            pool: ConcurrencyPool::new(pool_options),
            request_delay,
        }
    }

    pub async fn evaluate(&self, symbols: &[String], criteria: &FilterCriteria) -> EligibilityOutcome {
        let perpetual_universe = self.resolve_perpetual_universe().await;

        let feed = self.feed.clone();
        let criteria = criteria.clone();
        let request_delay = self.request_delay;
        let universe = Arc::new(perpetual_universe);

        let items: Vec<String> = symbols.to_vec();
        let result = self
            .pool
            .run(items, move |symbol: String| {
                let feed = feed.clone();
                let criteria = criteria.clone();
                let universe = universe.clone();
                async move { evaluate_one(&feed, &symbol, &criteria, &universe, request_delay).await }
            })
            .await;

        let mut outcome = EligibilityOutcome::default();
        for (symbol, reasons) in result.results {
            if reasons.is_empty() {
                outcome.valid.push(symbol);
            } else {
                outcome.invalid.push(symbol.clone());
                outcome.reasons.insert(symbol, reasons);
            }
        }
        for (symbol, err) in result.errors {
            if err.cause.is_rate_limited() {
                warn!(symbol, "eligibility history probe rate limited after retries, treating as invalid");
            } else {
                warn!(symbol, error = %err, "eligibility history probe failed after retries, treating as invalid");
            }
            outcome.invalid.push(symbol.clone());
            outcome
                .reasons
                .insert(symbol, vec![format!("history probe failed: {err}")]);
        }

        outcome.valid.sort();
        outcome.invalid.sort();
        outcome
    }

    async fn resolve_perpetual_universe(&self) -> HashSet<String> {
        crate::market_feed::fetch_perpetual_universe(self.feed.as_ref()).await
    }
}

async fn evaluate_one(
    feed: &Arc<dyn MarketFeed>,
    symbol: &str,
    criteria: &FilterCriteria,
    perpetual_universe: &HashSet<String>,
    request_delay: Duration,
) -> Result<Vec<String>, MarketFeedError> {
    let mut reasons = Vec::new();

    if let Some(parts) = decompose(symbol) {
        if criteria.exclude_stablecoins && is_stablecoin_base(&parts.base_asset) {
            reasons.push("stablecoin excluded".to_string());
        }
        if parts.base_asset == "BTC" {
            reasons.push("BTC excluded".to_string());
        }
        if criteria.require_futures && resolve_futures_symbol(symbol, perpetual_universe).is_none() {
            reasons.push("no futures mapping".to_string());
        }
    }

    // Cheap rules already disqualify the symbol; skip the network probe.
    if !reasons.is_empty() {
        return Ok(reasons);
    }

    tokio::time::sleep(request_delay).await;

    let probe_start = criteria.reference_time - chrono::Duration::days(criteria.min_history_days);
    let probe_end = criteria.reference_time - chrono::Duration::days(7);

    match feed.klines(symbol, Interval::OneDay, probe_start, probe_end, 10).await {
        Ok(candles) => {
            let earliest = candles.iter().map(|c| c.open_time).min();
            match earliest {
                Some(open_time) if (open_time - probe_start).num_days().abs() <= 30 => Ok(reasons),
                _ => {
                    reasons.push(format!("历史数据不足{}天", criteria.min_history_days));
                    Ok(reasons)
                }
            }
        }
        Err(err) if err.is_permanent() => {
            reasons.push(format!("历史数据不足{}天", criteria.min_history_days));
            Ok(reasons)
        }
        Err(err) => Err(err),
    }
}

impl FilterCriteria {
    /// Convenience constructor mirroring the defaults BacktestEngine applies
    /// when it calls into EligibilityFilter (spec.md §4.2, §6).
    pub fn for_reference_time(reference_time: chrono::DateTime<Utc>, quote_asset: impl Into<String>) -> Self {
        Self {
            reference_time,
            quote_asset: quote_asset.into(),
            min_volume_threshold: 10_000.0,
            min_history_days: 365,
            require_futures: true,
            exclude_stablecoins: true,
            include_inactive: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_feed::{ContractType, FuturesSymbolInfo, SpotSymbolInfo};
    use crate::models::Candle;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::sync::Mutex;

    struct FakeFeed {
        perpetuals: Vec<String>,
        history: Mutex<BTreeMap<String, Vec<Candle>>>,
    }

    #[async_trait]
    impl MarketFeed for FakeFeed {
        async fn exchange_info(&self) -> Result<Vec<SpotSymbolInfo>, MarketFeedError> {
            Ok(vec![])
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
            _interval: Interval,
            _start_time: DateTime<Utc>,
            _end_time: DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<Candle>, MarketFeedError> {
            Ok(self.history.lock().unwrap().get(symbol).cloned().unwrap_or_default())
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
        ) -> Result<Vec<crate::models::FundingRateObservation>, MarketFeedError> {
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
            close_time: open_time + chrono::Duration::days(1),
            quote_volume: 1.0,
            trades: 1,
            taker_buy_volume: 0.5,
            taker_buy_quote_volume: 0.5,
        }
    }

    #[tokio::test]
    async fn excludes_stablecoins_and_btc_without_network() {
        let feed: Arc<dyn MarketFeed> = Arc::new(FakeFeed {
            perpetuals: vec!["ETHUSDT".to_string()],
            history: Mutex::new(BTreeMap::new()),
        });
        let filter = EligibilityFilter::new(feed, ConcurrencyPoolOptions::default(), Duration::from_millis(0));
        let t_ref = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        let criteria = FilterCriteria::for_reference_time(t_ref, "USDT");

        let outcome = filter
            .evaluate(&["USDTUSDT".to_string(), "BTCUSDT".to_string()], &criteria)
            .await;

        assert!(outcome.valid.is_empty());
        assert_eq!(outcome.invalid.len(), 2);
    }

    #[tokio::test]
    async fn requires_futures_mapping() {
        let feed: Arc<dyn MarketFeed> = Arc::new(FakeFeed {
            perpetuals: vec![],
            history: Mutex::new(BTreeMap::new()),
        });
        let filter = EligibilityFilter::new(feed, ConcurrencyPoolOptions::default(), Duration::from_millis(0));
        let t_ref = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        let criteria = FilterCriteria::for_reference_time(t_ref, "USDT");

        let outcome = filter.evaluate(&["SOMECOINUSDT".to_string()], &criteria).await;

        assert_eq!(outcome.invalid, vec!["SOMECOINUSDT".to_string()]);
        assert!(outcome.reasons["SOMECOINUSDT"].contains(&"no futures mapping".to_string()));
    }

    #[tokio::test]
    async fn sufficient_history_passes() {
        let t_ref = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        let probe_start = t_ref - chrono::Duration::days(365);
        let mut history = BTreeMap::new();
        history.insert("ETHUSDT".to_string(), vec![candle(probe_start)]);

        let feed: Arc<dyn MarketFeed> = Arc::new(FakeFeed {
            perpetuals: vec!["ETHUSDT".to_string()],
            history: Mutex::new(history),
        });
        let filter = EligibilityFilter::new(feed, ConcurrencyPoolOptions::default(), Duration::from_millis(0));
        let criteria = FilterCriteria::for_reference_time(t_ref, "USDT");

        let outcome = filter.evaluate(&["ETHUSDT".to_string()], &criteria).await;

        assert_eq!(outcome.valid, vec!["ETHUSDT".to_string()]);
    }

    #[tokio::test]
    async fn insufficient_history_fails() {
        let t_ref = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        let mut history = BTreeMap::new();
        history.insert("ETHUSDT".to_string(), vec![candle(t_ref - chrono::Duration::days(10))]);

        let feed: Arc<dyn MarketFeed> = Arc::new(FakeFeed {
            perpetuals: vec!["ETHUSDT".to_string()],
            history: Mutex::new(history),
        });
        let filter = EligibilityFilter::new(feed, ConcurrencyPoolOptions::default(), Duration::from_millis(0));
        let criteria = FilterCriteria::for_reference_time(t_ref, "USDT");

        let outcome = filter.evaluate(&["ETHUSDT".to_string()], &criteria).await;

        assert_eq!(outcome.invalid, vec!["ETHUSDT".to_string()]);
    }
}
