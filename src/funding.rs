//! `FundingRateEnricher` (spec.md §4.7): attaches `currentFundingRate` /
//! `fundingRateHistory` to every rankings row that has a futures mapping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::concurrency::{ConcurrencyPool, ConcurrencyPoolOptions};
use crate::market_feed::MarketFeed;
use crate::models::{FundingRateObservation, LeaderboardItem};

const BATCH_SIZE: usize = 20;
const BATCH_DELAY_MS: u64 = 2_000;

pub struct FundingRateEnricher {
    feed: Arc<dyn MarketFeed>,
    pool: ConcurrencyPool,
}

impl FundingRateEnricher {
    pub fn new(feed: Arc<dyn MarketFeed>) -> Self {
        Self {
            feed,
            pool: ConcurrencyPool::new(ConcurrencyPoolOptions {
                initial_concurrency: 5,
                min_concurrency: 1,
                max_concurrency: 5,
                adaptive: false,
                retry: true,
                max_retries: 2,
            }),
        }
    }

    /// Never fails the row: on any irrecoverable error the affected symbols
    /// are simply left with empty history / absent current rate.
    pub async fn enrich(&self, rankings: &mut [LeaderboardItem], t: DateTime<Utc>, granularity_hours: i64) {
        let threshold = t + chrono::Duration::minutes(10);
        let window_end = t + chrono::Duration::hours(granularity_hours) + chrono::Duration::minutes(10);

        let futures_symbols: Vec<String> = rankings
            .iter()
            .filter_map(|item| item.future_symbol.clone())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();

        let mut all_observations: HashMap<String, Vec<FundingRateObservation>> = HashMap::new();

        for batch in futures_symbols.chunks(BATCH_SIZE) {
            let feed = self.feed.clone();
            let result = self
                .pool
                .run(batch.to_vec(), move |symbol: String| {
                    let feed = feed.clone();
                    async move { feed.funding_rate_history(&symbol, t, window_end, 100).await }
                })
                .await;

            for (symbol, observations) in result.results {
                all_observations.insert(symbol, observations);
            }
            for (symbol, err) in result.errors {
                warn!(symbol, error = %err, "funding rate query failed after retries, leaving row unenriched");
            }

            tokio::time::sleep(Duration::from_millis(BATCH_DELAY_MS)).await;
        }

        for item in rankings.iter_mut() {
            let Some(future_symbol) = &item.future_symbol else {
                continue;
            };
            let Some(observations) = all_observations.get(future_symbol) else {
                continue;
            };

            let current = observations
                .iter()
                .filter(|o| o.funding_time <= threshold)
                .max_by_key(|o| o.funding_time);
            item.current_funding_rate = current.map(|o| o.funding_rate);

            item.funding_rate_history = observations
                .iter()
                .filter(|o| o.funding_time > threshold)
                .copied()
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaderboard::build_item;
    use crate::market_feed::{ContractType, FuturesSymbolInfo, Interval, SpotSymbolInfo};
    use crate::models::{Candle, VolumeWindow};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct FakeFeed {
        observations: Mutex<HashMap<String, Vec<FundingRateObservation>>>,
    }

    #[async_trait]
    impl MarketFeed for FakeFeed {
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
            _start_time: DateTime<Utc>,
            _end_time: DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<Candle>, crate::error::MarketFeedError> {
            Ok(vec![])
        }
        async fn futures_klines(
            &self,
            _symbol: &str,
            _interval: Interval,
            _start_time: DateTime<Utc>,
            _end_time: DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<Candle>, crate::error::MarketFeedError> {
            Ok(vec![])
        }
        async fn funding_rate_history(
            &self,
            symbol: &str,
            _start_time: DateTime<Utc>,
            _end_time: DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<FundingRateObservation>, crate::error::MarketFeedError> {
            Ok(self.observations.lock().unwrap().get(symbol).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn splits_observations_at_threshold() {
        let t = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        let mut observations = HashMap::new();
        observations.insert(
            "ETHUSDT".to_string(),
            vec![
                FundingRateObservation {
                    funding_time: t,
                    funding_rate: 0.0001,
                    mark_price: Some(3000.0),
                },
                FundingRateObservation {
                    funding_time: t + chrono::Duration::hours(8),
                    funding_rate: 0.0002,
                    mark_price: None,
                },
            ],
        );

        let feed: Arc<dyn MarketFeed> = Arc::new(FakeFeed {
            observations: Mutex::new(observations),
        });
        let enricher = FundingRateEnricher::new(feed);

        let window = VolumeWindow::from_candles(vec![]);
        let mut item = build_item("ETHUSDT", &window).unwrap();
        item.future_symbol = Some("ETHUSDT".to_string());
        let mut rankings = vec![item];

        enricher.enrich(&mut rankings, t, 8).await;

        assert_eq!(rankings[0].current_funding_rate, Some(0.0001));
        assert_eq!(rankings[0].funding_rate_history.len(), 1);
        assert_eq!(rankings[0].funding_rate_history[0].funding_rate, 0.0002);
    }
}
