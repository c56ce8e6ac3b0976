//! Core data model (spec.md §3).
//!
//! Closed structs/enums throughout — the source's dynamic field bags are
//! replaced with typed schemas per spec.md §9.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One 1-hour bar from the market feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: DateTime<Utc>,
    pub quote_volume: f64,
    pub trades: u64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
}

/// The trailing 24h of 1h candles for one symbol at one instant.
///
/// Owned exclusively by the period computation that built it; never shared
/// across periods (spec.md §3 Lifecycle, §5).
#[derive(Debug, Clone, Default)]
pub struct VolumeWindow {
    pub data: Vec<Candle>,
    pub volume_24h: f64,
    pub quote_volume_24h: f64,
}

impl VolumeWindow {
    pub fn from_candles(data: Vec<Candle>) -> Self {
        let volume_24h = data.iter().map(|c| c.volume).sum();
        let quote_volume_24h = data.iter().map(|c| c.quote_volume).sum();
        debug_assert!(data.len() <= 24);
        Self {
            data,
            volume_24h,
            quote_volume_24h,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() >= 24
    }

    pub fn price_at_time(&self) -> Option<f64> {
        self.data.last().map(|c| c.open)
    }

    pub fn price_24h_ago(&self) -> Option<f64> {
        self.data.first().map(|c| c.open)
    }

    pub fn price_change_24h(&self) -> f64 {
        match (self.price_24h_ago(), self.price_at_time()) {
            (Some(before), Some(now)) if before != 0.0 => (now - before) / before * 100.0,
            _ => 0.0,
        }
    }

    pub fn high_24h(&self) -> Option<f64> {
        self.data
            .iter()
            .map(|c| c.high)
            .fold(None, |acc, h| Some(acc.map_or(h, |a: f64| a.max(h))))
    }

    pub fn low_24h(&self) -> Option<f64> {
        self.data
            .iter()
            .map(|c| c.low)
            .fold(None, |acc, l| Some(acc.map_or(l, |a: f64| a.min(l))))
    }

    pub fn volatility_24h(&self) -> f64 {
        match (self.high_24h(), self.low_24h()) {
            (Some(high), Some(low)) if low != 0.0 => (high - low) / low * 100.0,
            _ => 0.0,
        }
    }
}

/// One leaderboard row, emitted per symbol per period instant (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardItem {
    pub rank: u32,
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub price_change_24h: f64,
    pub price_at_time: f64,
    pub price_24h_ago: f64,
    pub volume_24h: f64,
    pub quote_volume_24h: f64,
    pub market_share: f64,
    pub volatility_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub future_symbol: Option<String>,
    pub future_price_at_time: Option<f64>,
    pub funding_rate_history: Vec<FundingRateObservation>,
    pub current_funding_rate: Option<f64>,
}

/// One funding-rate observation for a perpetual contract (spec.md §4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FundingRateObservation {
    pub funding_time: DateTime<Utc>,
    pub funding_rate: f64,
    pub mark_price: Option<f64>,
}

/// One persisted record per period instant (spec.md §3). Primary key:
/// `timestamp`. Upsert always replaces the whole document (spec.md §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRow {
    pub timestamp: DateTime<Utc>,
    pub hour: u32,
    pub rankings: Vec<LeaderboardItem>,
    pub removed_symbols: Vec<LeaderboardItem>,
    pub total_market_volume: f64,
    pub total_market_quote_volume: f64,
    pub btc_price: f64,
    pub btc_price_change_24h: f64,
    pub btcdom_price: Option<f64>,
    pub btcdom_price_change_24h: Option<f64>,
    pub calculation_duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Eligibility-filter criteria, participating in the `FilterCache` hash
/// (spec.md §4.3). Only the date portion of `reference_time` is hashed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterCriteria {
    pub reference_time: DateTime<Utc>,
    pub quote_asset: String,
    pub min_volume_threshold: f64,
    pub min_history_days: i64,
    pub require_futures: bool,
    pub exclude_stablecoins: bool,
    pub include_inactive: bool,
}

/// Per-reason histogram and counts recorded alongside a cache entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterStatistics {
    pub valid_count: usize,
    pub invalid_count: usize,
    pub reason_histogram: std::collections::BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolFilterCacheEntry {
    pub filter_hash: String,
    pub criteria: FilterCriteria,
    pub valid_symbols: Vec<String>,
    pub invalid_symbols: Vec<String>,
    pub invalid_reasons: std::collections::BTreeMap<String, Vec<String>>,
    pub statistics: FilterStatistics,
    pub processing_time_ms: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub hit_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Parameters for one backtest invocation (spec.md §6 parameter contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestParams {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_min_volume_threshold")]
    pub min_volume_threshold: f64,
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    #[serde(default = "default_min_history_days")]
    pub min_history_days: i64,
    #[serde(default = "default_granularity_hours")]
    pub granularity_hours: i64,
}

fn default_limit() -> usize {
    50
}
fn default_min_volume_threshold() -> f64 {
    10_000.0
}
fn default_quote_asset() -> String {
    "USDT".to_string()
}
fn default_min_history_days() -> i64 {
    365
}
fn default_granularity_hours() -> i64 {
    8
}

impl Default for BacktestParams {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            end_time: Utc::now(),
            symbols: None,
            limit: default_limit(),
            min_volume_threshold: default_min_volume_threshold(),
            quote_asset: default_quote_asset(),
            min_history_days: default_min_history_days(),
            granularity_hours: default_granularity_hours(),
        }
    }
}

/// One asynchronous backtest task owned by the `TaskSupervisor` (spec.md §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncBacktestTask {
    pub task_id: String,
    pub status: TaskStatus,
    pub params: BacktestParams,
    pub current_time: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub processing_time_ms: i64,
}

/// Market-wide stats accompanying a leaderboard (spec.md §4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketStats {
    pub total_volume: f64,
    pub total_quote_volume: f64,
    pub top10_concentration: f64,
}

/// Benchmark price pair (BTC spot, BTCDOM perp) at an instant (spec.md §4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct BenchmarkPrice {
    pub price: f64,
    pub price_24h_ago: f64,
    pub change_24h: f64,
}
