//! `MarketFeed` capability (spec.md §6): exchange info, candles, and
//! funding-rate history, with retry/429 handling owned by the
//! implementation, not the caller.

pub mod http;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::MarketFeedError;
use crate::models::{Candle, FundingRateObservation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotSymbolInfo {
    pub symbol: String,
    pub status: String,
    pub quote_asset: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractType {
    Perpetual,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuturesSymbolInfo {
    pub symbol: String,
    pub status: String,
    pub contract_type: ContractType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    OneHour,
    OneDay,
}

impl Interval {
    pub fn as_feed_str(&self) -> &'static str {
        match self {
            Interval::OneHour => "1h",
            Interval::OneDay => "1d",
        }
    }
}

/// Stateless, retrying market-data capability. Implementations must honor
/// spec.md §6: "all methods must transparently retry up to 3 times with
/// exponentially-backed-off delay, distinguishing rate-limit errors
/// (longer delay) from transport errors."
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn exchange_info(&self) -> Result<Vec<SpotSymbolInfo>, MarketFeedError>;

    async fn futures_exchange_info(&self) -> Result<Vec<FuturesSymbolInfo>, MarketFeedError>;

    async fn klines(
        &self,
        symbol: &str,
        interval: Interval,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Candle>, MarketFeedError>;

    async fn futures_klines(
        &self,
        symbol: &str,
        interval: Interval,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Candle>, MarketFeedError>;

    async fn funding_rate_history(
        &self,
        symbol: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<FundingRateObservation>, MarketFeedError>;
}

/// The set of symbols currently live as TRADING perpetual futures, used to
/// resolve the spot -> futures mapping (spec.md §3). A feed failure here is
/// non-fatal: callers treat an empty universe as "no futures available",
/// not as a request failure.
pub async fn fetch_perpetual_universe(feed: &dyn MarketFeed) -> HashSet<String> {
    match feed.futures_exchange_info().await {
        Ok(symbols) => symbols
            .into_iter()
            .filter(|s| s.status == "TRADING" && s.contract_type == ContractType::Perpetual)
            .map(|s| s.symbol)
            .collect(),
        Err(err) => {
            warn!(error = %err, "failed to resolve perpetual futures universe, treating none as mapped");
            HashSet::new()
        }
    }
}
